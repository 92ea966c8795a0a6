//! Join frame exchanged when a WebSocket client connects.
//!
//! The client opens with `{"type":"join","peerId":"..."}` and the server
//! answers with its own join frame. Every frame after that is a
//! `MessageEnvelope` in JSON.

use repo_net::PeerId;
use serde::{Deserialize, Serialize};

/// Maximum frame size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

const JOIN_TYPE: &str = "join";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    /// Always "join"
    #[serde(rename = "type")]
    pub msg_type: String,
    pub peer_id: PeerId,
}

impl JoinMessage {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            msg_type: JOIN_TYPE.to_string(),
            peer_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse a join frame. Returns None for anything else.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let msg: Self = serde_json::from_slice(data).ok()?;
        (msg.msg_type == JOIN_TYPE).then_some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wire_format() {
        let join = JoinMessage::new("client-1".parse().unwrap());
        let json = join.to_json().unwrap();
        assert_eq!(json, r#"{"type":"join","peerId":"client-1"}"#);
        assert_eq!(JoinMessage::from_bytes(json.as_bytes()), Some(join));
    }

    #[test]
    fn test_other_frames_are_not_joins() {
        assert!(JoinMessage::from_bytes(br#"{"type":"sync","peerId":"a"}"#).is_none());
        assert!(JoinMessage::from_bytes(b"\x00\x01").is_none());
        assert!(JoinMessage::from_bytes(br#"{"type":"join"}"#).is_none());
    }
}
