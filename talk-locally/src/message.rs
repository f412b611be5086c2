use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Payloads that can ride a room topic.
///
/// Rooms are generic over this so the chat rooms and the reserved directory
/// room share one delivery loop while keeping their own wire formats.
pub trait WireMessage: Sized + Send + 'static {
    fn encode(&self) -> Result<Vec<u8>, CodecError>;
    fn decode(payload: &[u8]) -> Result<Self, CodecError>;
}

/// A chat line as it travels between peers.
///
/// Field names on the wire stay compatible with the older nodes that spoke
/// this protocol first, so they do not follow Rust casing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(rename = "Message")]
    pub text: String,
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "SenderNick")]
    pub sender_nick: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, sender: &PeerId, nickname: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender_id: sender.to_string(),
            sender_nick: nickname.into(),
        }
    }
}

impl WireMessage for ChatMessage {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Directory payload: the bare name of the room a peer is sitting in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomAdvert(pub String);

impl RoomAdvert {
    pub fn room_name(&self) -> &str {
        &self.0
    }
}

impl WireMessage for RoomAdvert {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.0.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(self.0.as_bytes().to_vec())
    }

    fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let name = String::from_utf8(payload.to_vec())?;
        if name.trim().is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(Self(name))
    }
}
