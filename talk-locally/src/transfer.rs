//! Pushing files straight to the people in a room.
//!
//! The room only hears a one-line announcement; the bytes go over a direct
//! stream per peer. A stream is the file name, a newline, then the raw file
//! until the sender closes it. There is no length prefix, checksum or
//! acknowledgement, and a failed peer is simply reported.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::{
    future::join_all,
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
};
use libp2p::{PeerId, StreamProtocol};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::{error::TransferError, message::ChatMessage, room::Room};

pub const FILE_PROTOCOL: StreamProtocol = StreamProtocol::new("/universal-connectivity-file/1");

pub const CHUNK_SIZE: usize = 32 * 1024;

/// Prefix put in front of every file written by the receiver.
pub const RECEIVED_PREFIX: &str = "received_";

/// Longest header line a receiver accepts before giving up on the stream.
pub const MAX_HEADER_LEN: u64 = 4096;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub type TransferStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens outbound transfer streams to peers.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    async fn open(&self, peer: PeerId) -> Result<TransferStream, TransferError>;
}

/// Outcome of one send: who got the file and who did not.
#[derive(Debug)]
pub struct TransferReport {
    pub file_id: String,
    pub delivered: Vec<PeerId>,
    pub failed: Vec<(PeerId, TransferError)>,
}

/// The identifier a file travels under: its base name.
pub fn file_id(path: &Path) -> Result<String, TransferError> {
    base_name(&path.to_string_lossy())
}

pub fn announcement(file_id: &str) -> String {
    format!("File available: {file_id}")
}

fn base_name(raw: &str) -> Result<String, TransferError> {
    let trimmed = raw.trim_end_matches(LINE_ENDINGS).trim();
    Path::new(trimmed)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| TransferError::InvalidFileId(raw.to_string()))
}

/// Announces `path` in `room`, then streams it to every other peer on the
/// room's roster concurrently.
pub async fn send_file<O>(
    room: &Room<ChatMessage>,
    opener: &O,
    path: &Path,
) -> Result<TransferReport, TransferError>
where
    O: StreamOpener + ?Sized,
{
    let metadata = match fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(path.to_path_buf()));
        }
        Err(error) => return Err(error.into()),
    };
    if !metadata.is_file() {
        return Err(TransferError::NotAFile(path.to_path_buf()));
    }
    let file_id = file_id(path)?;

    room.publish(&announcement(&file_id)).await?;
    info!(room = room.name(), file = %file_id, "file announced");

    let local = room.local_peer();
    let recipients: Vec<PeerId> = room
        .active_peers()
        .into_iter()
        .filter(|peer| *peer != local)
        .collect();

    let outcomes = join_all(recipients.into_iter().map(|peer| {
        let file_id = file_id.as_str();
        async move {
            let outcome = push_to_peer(opener, peer, file_id, path).await;
            (peer, outcome)
        }
    }))
    .await;

    let mut report = TransferReport {
        file_id,
        delivered: Vec::new(),
        failed: Vec::new(),
    };
    for (peer, outcome) in outcomes {
        match outcome {
            Ok(bytes) => {
                debug!(%peer, bytes, "file streamed");
                report.delivered.push(peer);
            }
            Err(error) => {
                warn!(%peer, %error, "file transfer to peer failed");
                report.failed.push((peer, error));
            }
        }
    }

    Ok(report)
}

async fn push_to_peer<O>(
    opener: &O,
    peer: PeerId,
    file_id: &str,
    path: &Path,
) -> Result<u64, TransferError>
where
    O: StreamOpener + ?Sized,
{
    let mut stream = opener.open(peer).await?;
    write_transfer(&mut stream, file_id, path).await
}

/// Writes one complete transfer to `stream`: header line, file body in
/// [`CHUNK_SIZE`] pieces, then close. Returns the number of body bytes.
pub async fn write_transfer<W>(stream: &mut W, file_id: &str, path: &Path) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut file = fs::File::open(path).await?;

    stream.write_all(file_id.as_bytes()).await?;
    stream.write_all(b"\n").await?;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let read = tokio::io::AsyncReadExt::read(&mut file, &mut buffer).await?;
        if read == 0 {
            break;
        }
        stream.write_all(&buffer[..read]).await?;
        sent += read as u64;
    }

    stream.close().await?;
    Ok(sent)
}

/// Reads one inbound transfer and stores it under `download_dir`.
///
/// The header is reduced to its base name so a sender cannot write outside
/// the directory. An empty body counts as a failed transfer and leaves no
/// file behind.
pub async fn receive_file<R>(stream: R, download_dir: &Path) -> Result<PathBuf, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);

    let mut header = String::new();
    (&mut reader)
        .take(MAX_HEADER_LEN)
        .read_line(&mut header)
        .await?;
    if !header.ends_with('\n') && header.len() as u64 >= MAX_HEADER_LEN {
        return Err(TransferError::HeaderTooLong(MAX_HEADER_LEN));
    }
    let file_id = base_name(&header)?;

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload).await?;
    if payload.is_empty() {
        return Err(TransferError::EmptyPayload(file_id));
    }

    let target = download_dir.join(format!("{RECEIVED_PREFIX}{file_id}"));
    fs::write(&target, &payload).await?;
    info!(file = %file_id, bytes = payload.len(), path = %target.display(), "file received");
    Ok(target)
}
