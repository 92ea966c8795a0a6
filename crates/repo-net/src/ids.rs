//! String identifiers for shares, documents and network sessions.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a trust group ("team").
    ShareId
);

string_id!(
    /// Identifier of a synchronized document.
    DocumentId
);

string_id!(
    /// Random value generated once per network subsystem, used to scope
    /// ephemeral message counters.
    SessionId
);

impl ShareId {
    /// Random 16-hex-character share id.
    pub fn generate() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("{:016x}", id))
    }
}

impl DocumentId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl SessionId {
    pub fn generate() -> Self {
        use rand::Rng;
        let id: u64 = rand::rng().random();
        Self(format!("{:x}", id))
    }
}
