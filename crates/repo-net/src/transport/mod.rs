//! NetworkAdapter trait for pluggable transports.
//!
//! Implementations:
//! - `MemoryAdapter`: in-process pair, for tests and same-process peers
//! - `AuthenticatedAdapter`: decorator produced by `AuthProvider::wrap_network_adapter`
//! - `WebSocketServerAdapter` (repo-server): one socket per connected client
//!
//! An adapter publishes everything it observes on its `EventBus`. `send` only
//! enqueues; delivery (and any event it causes) happens asynchronously, so a
//! subscriber may call `send` from inside its callback.

pub mod memory;

pub use memory::MemoryAdapter;

use crate::events::EventBus;
use crate::protocol::{ChannelId, MessageEnvelope};
use crate::PeerId;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Adapter is closed")]
    Closed,

    #[error("Peer {0} has not authenticated")]
    NotAuthenticated(PeerId),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Error payload carried by events. Cloneable so every subscriber sees it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Everything an adapter reports upward.
#[derive(Clone)]
pub enum AdapterEvent {
    /// The adapter finished connecting and can be used.
    Ready,
    /// A remote peer became reachable on `channel_id`.
    PeerCandidate { peer_id: PeerId, channel_id: ChannelId },
    PeerDisconnected { peer_id: PeerId },
    Message(MessageEnvelope),
    Error {
        peer_id: Option<PeerId>,
        channel_id: Option<ChannelId>,
        error: SharedError,
    },
    /// The adapter shut down; every peer it served is gone.
    Close,
}

impl std::fmt::Debug for AdapterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::PeerCandidate { peer_id, channel_id } => {
                write!(f, "PeerCandidate({}, {})", peer_id, channel_id)
            }
            Self::PeerDisconnected { peer_id } => write!(f, "PeerDisconnected({})", peer_id),
            Self::Message(env) => write!(
                f,
                "Message({} on {}, {} bytes)",
                env.msg_type,
                env.channel_id,
                env.message.len()
            ),
            Self::Error {
                peer_id,
                channel_id,
                error,
            } => write!(f, "Error({:?}, {:?}, {})", peer_id, channel_id, error),
            Self::Close => write!(f, "Close"),
        }
    }
}

/// A physical (or decorated) transport.
pub trait NetworkAdapter: Send + Sync {
    /// Event stream for this adapter.
    fn events(&self) -> &Arc<EventBus<AdapterEvent>>;

    /// Start the adapter as `peer_id`. Emits `Ready` once usable.
    fn connect(&self, peer_id: PeerId);

    /// Enqueue an envelope for its `target_id`.
    fn send(&self, envelope: MessageEnvelope) -> Result<()>;

    /// Tear down every connection and emit `Close`.
    fn disconnect(&self);
}
