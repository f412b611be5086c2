use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use futures::{io::Cursor, AsyncWrite};
use libp2p::PeerId;
use parking_lot::Mutex;
use talk_locally::{
    error::TransferError,
    message::ChatMessage,
    pubsub::LocalHub,
    room::{Room, RoomManager},
    transfer::{receive_file, send_file, StreamOpener, TransferStream},
};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

/// Collects everything written to it and remembers whether it was closed.
#[derive(Clone, Default)]
struct Capture {
    bytes: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
}

impl AsyncWrite for Capture {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.bytes.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        *self.closed.lock() = true;
        Poll::Ready(Ok(()))
    }
}

/// Hands out one capture per peer; peers in `unreachable` fail to open.
#[derive(Default)]
struct CapturingOpener {
    streams: Mutex<HashMap<PeerId, Capture>>,
    unreachable: Vec<PeerId>,
}

impl CapturingOpener {
    fn captured(&self, peer: &PeerId) -> Option<Capture> {
        self.streams.lock().get(peer).cloned()
    }
}

#[async_trait]
impl StreamOpener for CapturingOpener {
    async fn open(&self, peer: PeerId) -> Result<TransferStream, TransferError> {
        if self.unreachable.contains(&peer) {
            return Err(TransferError::OpenStream {
                peer,
                reason: "peer unreachable".into(),
            });
        }
        let capture = Capture::default();
        self.streams.lock().insert(peer, capture.clone());
        Ok(Box::new(capture))
    }
}

fn manager(hub: &LocalHub, nickname: &str) -> RoomManager {
    let peer = PeerId::random();
    let (link, inbound) = hub.attach(peer);
    RoomManager::new(peer, nickname, Arc::new(link), inbound)
}

/// Sender plus two receivers in one room, with both receivers on the
/// sender's roster.
struct Fixture {
    sender: RoomManager,
    sender_room: Room<ChatMessage>,
    x: RoomManager,
    x_room: Room<ChatMessage>,
    y: RoomManager,
    _y_room: Room<ChatMessage>,
}

async fn fixture() -> Result<Fixture> {
    let hub = LocalHub::new();
    let sender = manager(&hub, "sender");
    let x = manager(&hub, "x");
    let y = manager(&hub, "y");

    let sender_room = sender.join("files").await?;
    let x_room = x.join("files").await?;
    let y_room = y.join("files").await?;

    x_room.publish("x here").await?;
    y_room.publish("y here").await?;
    timeout(WAIT, async {
        while sender_room.active_peers().len() < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    Ok(Fixture {
        sender,
        sender_room,
        x,
        x_room,
        y,
        _y_room: y_room,
    })
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|n| (n % 251) as u8).collect()
}

#[tokio::test]
async fn file_reaches_every_other_peer_in_the_room() -> Result<()> {
    let mut fx = fixture().await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("data.bin");
    let body = payload(100 * 1024);
    tokio::fs::write(&path, &body).await?;

    // Drain the greetings x already heard from y.
    while timeout(Duration::from_millis(100), fx.x_room.next_message())
        .await
        .is_ok()
    {}

    let opener = CapturingOpener::default();
    let report = send_file(&fx.sender_room, &opener, &path).await?;

    assert_eq!(report.file_id, "data.bin");
    assert_eq!(report.delivered.len(), 2);
    assert!(report.failed.is_empty());
    assert!(opener.captured(&fx.sender.local_peer()).is_none());

    let mut expected = b"data.bin\n".to_vec();
    expected.extend_from_slice(&body);
    for peer in [fx.x.local_peer(), fx.y.local_peer()] {
        let capture = opener.captured(&peer).expect("stream opened");
        assert_eq!(*capture.bytes.lock(), expected);
        assert!(*capture.closed.lock());
    }

    let announcement = timeout(WAIT, fx.x_room.next_message())
        .await?
        .expect("announcement");
    assert_eq!(announcement.text, "File available: data.bin");

    // What the receiver makes of the captured stream.
    let downloads = tempfile::tempdir()?;
    let captured = opener.captured(&fx.x.local_peer()).expect("stream opened");
    let stream = Cursor::new(captured.bytes.lock().clone());
    let saved = receive_file(stream, downloads.path()).await?;
    assert_eq!(saved, downloads.path().join("received_data.bin"));
    assert_eq!(tokio::fs::read(&saved).await?, body);
    Ok(())
}

#[tokio::test]
async fn one_unreachable_peer_does_not_block_the_other() -> Result<()> {
    let fx = fixture().await?;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("notes.txt");
    tokio::fs::write(&path, b"meeting at noon").await?;

    let opener = CapturingOpener {
        unreachable: vec![fx.x.local_peer()],
        ..CapturingOpener::default()
    };
    let report = send_file(&fx.sender_room, &opener, &path).await?;

    assert_eq!(report.delivered, vec![fx.y.local_peer()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, fx.x.local_peer());
    assert!(matches!(
        report.failed[0].1,
        TransferError::OpenStream { .. }
    ));

    let capture = opener.captured(&fx.y.local_peer()).expect("stream opened");
    assert_eq!(*capture.bytes.lock(), b"notes.txt\nmeeting at noon".to_vec());
    Ok(())
}

#[tokio::test]
async fn missing_file_is_rejected_before_announcing() -> Result<()> {
    let mut fx = fixture().await?;
    while timeout(Duration::from_millis(100), fx.x_room.next_message())
        .await
        .is_ok()
    {}

    let opener = CapturingOpener::default();
    let result = send_file(
        &fx.sender_room,
        &opener,
        std::path::Path::new("/definitely/not/here.txt"),
    )
    .await;

    assert!(matches!(result, Err(TransferError::NotFound(_))));
    assert!(timeout(Duration::from_millis(200), fx.x_room.next_message())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn directory_is_rejected_before_announcing() -> Result<()> {
    let mut fx = fixture().await?;
    while timeout(Duration::from_millis(100), fx.x_room.next_message())
        .await
        .is_ok()
    {}
    let dir = tempfile::tempdir()?;

    let opener = CapturingOpener::default();
    let result = send_file(&fx.sender_room, &opener, dir.path()).await;

    assert!(matches!(result, Err(TransferError::NotAFile(_))));
    assert!(opener.captured(&fx.x.local_peer()).is_none());
    assert!(timeout(Duration::from_millis(200), fx.x_room.next_message())
        .await
        .is_err());
    Ok(())
}

#[tokio::test]
async fn traversal_in_header_stays_in_download_dir() -> Result<()> {
    let downloads = tempfile::tempdir()?;
    let stream = Cursor::new(b"../../../../tmp/evil.sh\n#!/bin/sh".to_vec());

    let saved = receive_file(stream, downloads.path()).await?;

    assert_eq!(saved, downloads.path().join("received_evil.sh"));
    assert_eq!(tokio::fs::read(&saved).await?, b"#!/bin/sh");
    Ok(())
}
