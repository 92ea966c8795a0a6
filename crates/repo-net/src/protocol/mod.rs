//! Protocol definitions for peer communication.
//!
//! - Channel ids and their routing prefixes
//! - The message envelope carried by transport adapters

pub mod channel;
pub mod envelope;

pub use channel::{ChannelId, ChannelKind};
pub use envelope::{
    EphemeralMessage, MessageContents, MessageEnvelope, ProtocolError, RepoMessage, SyncMessage,
};
