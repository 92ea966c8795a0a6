//! Channel identifiers.
//!
//! A channel is a logical stream multiplexed over one adapter. The namespace is
//! partitioned by prefix so a message can be routed from its channel id alone:
//!
//! | Channel            | Traffic                                  |
//! |--------------------|------------------------------------------|
//! | `sync_channel`     | document synchronization                 |
//! | `auth_channel`     | raw authentication handshake             |
//! | `a/<shareId>`      | per-share authentication handshake       |
//! | `m/<name>`         | ephemeral (non-persisted) messages       |

use crate::ids::ShareId;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

pub const SYNC_CHANNEL: &str = "sync_channel";
pub const AUTH_CHANNEL: &str = "auth_channel";
pub const SHARE_AUTH_PREFIX: &str = "a/";
pub const EPHEMERAL_PREFIX: &str = "m/";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

/// What kind of traffic a channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Sync,
    Auth,
    ShareAuth(ShareId),
    Ephemeral,
    Other,
}

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn sync() -> Self {
        Self(SYNC_CHANNEL.to_string())
    }

    pub fn auth() -> Self {
        Self(AUTH_CHANNEL.to_string())
    }

    /// Handshake channel for one share: `a/<shareId>`.
    pub fn share_auth(share_id: &ShareId) -> Self {
        Self(format!("{}{}", SHARE_AUTH_PREFIX, share_id))
    }

    /// Ephemeral channel: `m/<name>`. Names that already carry the prefix are kept as-is.
    pub fn ephemeral(name: &str) -> Self {
        if name.starts_with(EPHEMERAL_PREFIX) {
            Self(name.to_string())
        } else {
            Self(format!("{}{}", EPHEMERAL_PREFIX, name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ChannelKind {
        if self.0 == SYNC_CHANNEL {
            ChannelKind::Sync
        } else if self.0 == AUTH_CHANNEL {
            ChannelKind::Auth
        } else if let Some(share) = self.0.strip_prefix(SHARE_AUTH_PREFIX) {
            ChannelKind::ShareAuth(ShareId::from(share))
        } else if self.0.starts_with(EPHEMERAL_PREFIX) {
            ChannelKind::Ephemeral
        } else {
            ChannelKind::Other
        }
    }

    /// True for both the raw auth channel and per-share handshake channels.
    pub fn is_auth(&self) -> bool {
        matches!(self.kind(), ChannelKind::Auth | ChannelKind::ShareAuth(_))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.kind() == ChannelKind::Ephemeral
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
