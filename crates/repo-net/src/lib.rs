//! repo-net: authenticated multi-adapter networking for peer-to-peer document sync.
//!
//! This crate provides:
//! - A network subsystem routing messages to peers across many transport adapters
//! - Share authentication: teams, handshakes and an authenticated adapter decorator
//! - Loro-backed documents kept in sync with every connected peer
//! - Ephemeral pub/sub for data that is never stored
//! - NetworkAdapter and StorageAdapter trait abstractions

pub mod auth;
pub mod document;
pub mod ephemeral;
pub mod events;
pub mod ids;
pub mod network;
pub mod peer_id;
pub mod protocol;
pub mod repo;
pub mod storage;
pub mod synchronizer;
pub mod transport;

pub use auth::{AuthEvent, AuthProvider, AuthProviderConfig, AuthenticatedAdapter};
pub use document::DocHandle;
pub use ephemeral::{EphemeralData, EphemeralEvent};
pub use events::{EventBus, Subscription};
pub use ids::{DocumentId, SessionId, ShareId};
pub use network::{NetworkEvent, NetworkSubsystem};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{ChannelId, MessageEnvelope};
pub use repo::{Repo, RepoConfig, RepoError};
pub use storage::{MemoryStorage, StorageAdapter};
pub use synchronizer::CollectionSynchronizer;
pub use transport::{AdapterEvent, MemoryAdapter, NetworkAdapter};
