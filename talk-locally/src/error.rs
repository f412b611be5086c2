use std::{io, path::PathBuf, string::FromUtf8Error};

use libp2p::PeerId;
use thiserror::Error;

/// Failures talking to the pub/sub substrate or the swarm behind it.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("swarm event loop is no longer running")]
    SwarmStopped,
    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to dial {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },
}

/// Reasons an inbound payload could not be turned into a message.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("payload is empty")]
    Empty,
}

#[derive(Debug, Error)]
pub enum RoomError {
    /// The room was already closed or left. Using it again is a caller bug.
    #[error("room is closed")]
    Closed,
    #[error("room name cannot be empty")]
    EmptyName,
    #[error("failed to encode message: {0}")]
    Encode(#[source] CodecError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("not a regular file: {}", .0.display())]
    NotAFile(PathBuf),
    #[error("transfer header longer than {0} bytes")]
    HeaderTooLong(u64),
    #[error("file identifier {0:?} has no usable base name")]
    InvalidFileId(String),
    #[error("received empty payload for {0:?}")]
    EmptyPayload(String),
    #[error("failed to open stream to {peer}: {reason}")]
    OpenStream { peer: PeerId, reason: String },
    #[error("transfer i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// Failures of the operations a frontend drives on a running node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("not in a room")]
    NoActiveRoom,
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}
