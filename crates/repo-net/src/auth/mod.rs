//! Share authentication.
//!
//! - `identity`, `team`, `crypto`: key material and membership graphs
//! - `handshake`: the per-(share, peer) authentication state machine
//! - `channel`: byte pipe isolating handshake traffic on one adapter
//! - `provider`: owns shares and wraps adapters into authenticated ones
//! - `adapter`: the authenticated adapter decorator and its message transform

pub mod adapter;
pub mod channel;
pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod provider;
pub mod team;

pub use adapter::{AuthenticatedAdapter, MessageTransform};
pub use channel::AuthChannel;
pub use crypto::{CryptoError, SymmetricKey};
pub use handshake::{Connection, ConnectionEvent, ConnectionState, HandshakeMessage, InitialContext};
pub use identity::{create_device, create_server, create_user, FullIdentity, IdentityKind, PublicIdentity};
pub use provider::{AuthEvent, AuthProvider, AuthProviderConfig, DeviceInvitation, MemberInvitation};
pub use team::{InvitationSeed, InviteOptions, Team, TeamError, TeamKeyring};

use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use crate::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Peer {0} disconnected before authenticating")]
    Disconnected(PeerId),

    #[error("Peer {0} has not authenticated")]
    NotAuthenticated(PeerId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Team(#[from] TeamError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, AuthError>;
