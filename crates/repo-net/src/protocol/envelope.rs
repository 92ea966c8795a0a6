//! Wire envelope for messages exchanged between peers.
//!
//! Adapters carry `MessageEnvelope`s: a loosely-typed struct mirroring the
//! JSON wire format. Before anything is dispatched to the synchronizer or the
//! ephemeral bus it is validated into a `RepoMessage`, which guarantees every
//! field the message kind requires is present.
//!
//! Wire format (camelCase JSON):
//! `{"type":"sync","senderId":"a","targetId":"b","channelId":"sync_channel","broadcast":false,"message":[1,2,3]}`
//!
//! Ephemeral envelopes additionally carry `count` and `sessionId`.

use crate::ids::SessionId;
use crate::protocol::channel::ChannelId;
use crate::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SYNC_TYPE: &str = "sync";
pub const EPHEMERAL_TYPE: &str = "ephemeral";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0:?}")]
    UnknownType(String),

    #[error("{kind} message is missing required field `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Envelope as carried by transport adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<PeerId>,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub message: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl MessageEnvelope {
    /// A point-to-point `sync` envelope.
    pub fn sync(sender_id: PeerId, target_id: PeerId, channel_id: ChannelId, message: Vec<u8>) -> Self {
        Self {
            msg_type: SYNC_TYPE.to_string(),
            sender_id: Some(sender_id),
            target_id: Some(target_id),
            channel_id,
            broadcast: false,
            message,
            count: None,
            session_id: None,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.msg_type == EPHEMERAL_TYPE
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON bytes.
    ///
    /// Only checks that the bytes are a well-formed envelope; use
    /// `RepoMessage::try_from` to validate the fields for its type.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Validated document-sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub channel_id: ChannelId,
    pub message: Vec<u8>,
    pub broadcast: bool,
}

/// Validated ephemeral message, stamped with its sender's sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralMessage {
    pub sender_id: PeerId,
    pub target_id: PeerId,
    pub channel_id: ChannelId,
    pub message: Vec<u8>,
    pub broadcast: bool,
    pub count: u64,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoMessage {
    Sync(SyncMessage),
    Ephemeral(EphemeralMessage),
}

impl RepoMessage {
    pub fn sender_id(&self) -> &PeerId {
        match self {
            Self::Sync(m) => &m.sender_id,
            Self::Ephemeral(m) => &m.sender_id,
        }
    }

    pub fn target_id(&self) -> &PeerId {
        match self {
            Self::Sync(m) => &m.target_id,
            Self::Ephemeral(m) => &m.target_id,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::Sync(m) => &m.channel_id,
            Self::Ephemeral(m) => &m.channel_id,
        }
    }

    pub fn message(&self) -> &[u8] {
        match self {
            Self::Sync(m) => &m.message,
            Self::Ephemeral(m) => &m.message,
        }
    }
}

fn required<T>(value: Option<T>, kind: &'static str, field: &'static str) -> Result<T> {
    value.ok_or(ProtocolError::MissingField { kind, field })
}

impl TryFrom<MessageEnvelope> for RepoMessage {
    type Error = ProtocolError;

    fn try_from(envelope: MessageEnvelope) -> Result<Self> {
        match envelope.msg_type.as_str() {
            SYNC_TYPE => Ok(Self::Sync(SyncMessage {
                sender_id: required(envelope.sender_id, SYNC_TYPE, "senderId")?,
                target_id: required(envelope.target_id, SYNC_TYPE, "targetId")?,
                channel_id: envelope.channel_id,
                message: envelope.message,
                broadcast: envelope.broadcast,
            })),
            EPHEMERAL_TYPE => Ok(Self::Ephemeral(EphemeralMessage {
                sender_id: required(envelope.sender_id, EPHEMERAL_TYPE, "senderId")?,
                target_id: required(envelope.target_id, EPHEMERAL_TYPE, "targetId")?,
                count: required(envelope.count, EPHEMERAL_TYPE, "count")?,
                session_id: required(envelope.session_id, EPHEMERAL_TYPE, "sessionId")?,
                channel_id: envelope.channel_id,
                message: envelope.message,
                broadcast: envelope.broadcast,
            })),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

impl From<SyncMessage> for MessageEnvelope {
    fn from(m: SyncMessage) -> Self {
        Self {
            msg_type: SYNC_TYPE.to_string(),
            sender_id: Some(m.sender_id),
            target_id: Some(m.target_id),
            channel_id: m.channel_id,
            broadcast: m.broadcast,
            message: m.message,
            count: None,
            session_id: None,
        }
    }
}

impl From<EphemeralMessage> for MessageEnvelope {
    fn from(m: EphemeralMessage) -> Self {
        Self {
            msg_type: EPHEMERAL_TYPE.to_string(),
            sender_id: Some(m.sender_id),
            target_id: Some(m.target_id),
            channel_id: m.channel_id,
            broadcast: m.broadcast,
            message: m.message,
            count: Some(m.count),
            session_id: Some(m.session_id),
        }
    }
}

impl From<RepoMessage> for MessageEnvelope {
    fn from(m: RepoMessage) -> Self {
        match m {
            RepoMessage::Sync(m) => m.into(),
            RepoMessage::Ephemeral(m) => m.into(),
        }
    }
}

/// Outbound message handed to `NetworkSubsystem::send`.
///
/// `Sync` and `Ephemeral` are new messages originating locally and get
/// stamped with the local sender id (and, for ephemeral, the next count and
/// the session id). `Relay` forwards someone else's ephemeral message as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContents {
    Sync {
        target_id: PeerId,
        channel_id: ChannelId,
        message: Vec<u8>,
        broadcast: bool,
    },
    Ephemeral {
        target_id: PeerId,
        channel_id: ChannelId,
        message: Vec<u8>,
        broadcast: bool,
    },
    Relay(EphemeralMessage),
}

impl MessageContents {
    pub fn target_id(&self) -> &PeerId {
        match self {
            Self::Sync { target_id, .. } | Self::Ephemeral { target_id, .. } => target_id,
            Self::Relay(m) => &m.target_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    // ==================== MessageEnvelope ====================

    #[test]
    fn test_sync_wire_format() {
        let env = MessageEnvelope::sync(peer("alice"), peer("bob"), ChannelId::sync(), vec![1, 2]);
        let json = String::from_utf8(env.to_json().unwrap()).unwrap();
        assert!(json.contains("\"type\":\"sync\""));
        assert!(json.contains("\"senderId\":\"alice\""));
        assert!(json.contains("\"targetId\":\"bob\""));
        assert!(json.contains("\"channelId\":\"sync_channel\""));
        assert!(json.contains("\"message\":[1,2]"));
        assert!(!json.contains("count"));
        assert!(!json.contains("sessionId"));
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(MessageEnvelope::from_json(b"not json").is_err());
        assert!(MessageEnvelope::from_json(b"{}").is_err());
        assert!(MessageEnvelope::from_json(br#"{"type":"sync","senderId":"","channelId":"x"}"#).is_err());
    }

    #[test]
    fn test_broadcast_defaults_false() {
        let json = br#"{"type":"sync","senderId":"a","targetId":"b","channelId":"sync_channel","message":[]}"#;
        let env = MessageEnvelope::from_json(json).unwrap();
        assert!(!env.broadcast);
    }

    // ==================== RepoMessage ====================

    #[test]
    fn test_validate_sync() {
        let env = MessageEnvelope::sync(peer("a"), peer("b"), ChannelId::sync(), vec![7]);
        let msg = RepoMessage::try_from(env).unwrap();
        assert!(matches!(msg, RepoMessage::Sync(_)));
        assert_eq!(msg.sender_id().as_str(), "a");
        assert_eq!(msg.message(), &[7]);
    }

    #[test]
    fn test_validate_ephemeral_requires_count_and_session() {
        let mut env = MessageEnvelope::sync(peer("a"), peer("b"), ChannelId::ephemeral("p"), vec![]);
        env.msg_type = EPHEMERAL_TYPE.to_string();

        let err = RepoMessage::try_from(env.clone()).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "count", .. }));

        env.count = Some(1);
        env.session_id = Some(SessionId::from("s1"));
        let msg = RepoMessage::try_from(env).unwrap();
        match msg {
            RepoMessage::Ephemeral(m) => {
                assert_eq!(m.count, 1);
                assert_eq!(m.session_id.as_str(), "s1");
            }
            other => panic!("expected ephemeral, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_missing_sender() {
        let mut env = MessageEnvelope::sync(peer("a"), peer("b"), ChannelId::sync(), vec![]);
        env.sender_id = None;
        assert!(matches!(
            RepoMessage::try_from(env),
            Err(ProtocolError::MissingField { field: "senderId", .. })
        ));
    }

    #[test]
    fn test_validate_unknown_type() {
        let mut env = MessageEnvelope::sync(peer("a"), peer("b"), ChannelId::sync(), vec![]);
        env.msg_type = "gossip".to_string();
        assert!(matches!(RepoMessage::try_from(env), Err(ProtocolError::UnknownType(t)) if t == "gossip"));
    }

    #[test]
    fn test_ephemeral_back_to_envelope() {
        let msg = EphemeralMessage {
            sender_id: peer("a"),
            target_id: peer("b"),
            channel_id: ChannelId::ephemeral("cursor"),
            message: vec![9],
            broadcast: true,
            count: 4,
            session_id: SessionId::from("s"),
        };
        let env = MessageEnvelope::from(msg.clone());
        assert!(env.is_ephemeral());
        assert_eq!(env.count, Some(4));
        assert_eq!(RepoMessage::try_from(env).unwrap(), RepoMessage::Ephemeral(msg));
    }
}
