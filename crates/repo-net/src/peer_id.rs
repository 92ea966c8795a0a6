//! PeerId: Opaque identifier for a peer in the network.
//!
//! Peer ids are chosen by each process (or assigned by the application, e.g. a
//! server uses its host name) and are stable for the lifetime of one logical
//! connection. Generated ids look like `peer-a1b2c3d4e5f67890`.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer ID cannot be empty")]
    Empty,
    #[error("Peer ID cannot contain whitespace: {0:?}")]
    Whitespace(String),
}

/// A unique identifier for a peer in the network.
///
/// # Examples
/// ```
/// use repo_net::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert!(peer_id.as_str().starts_with("peer-"));
///
/// let parsed: PeerId = "alice".parse().unwrap();
/// assert_eq!(parsed.as_str(), "alice");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random peer ID.
    ///
    /// Uses cryptographically secure randomness. The random part is never zero.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(format!("peer-{:016x}", id));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(PeerIdError::Whitespace(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<&str> for PeerId {
    type Error = PeerIdError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// Serialize as a plain string; deserialization goes through validation.
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let peer_id = PeerId::generate();
        let hex = peer_id.as_str().strip_prefix("peer-").unwrap();
        assert_eq!(hex.len(), 16);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(hex, "0000000000000000");
    }

    #[test]
    fn test_generate_unique() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }

    #[test]
    fn test_parse_plain_name() {
        let peer_id: PeerId = "sync.example.com".parse().unwrap();
        assert_eq!(peer_id.to_string(), "sync.example.com");
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!("".parse::<PeerId>(), Err(PeerIdError::Empty));
    }

    #[test]
    fn test_reject_whitespace() {
        assert!("alice smith".parse::<PeerId>().is_err());
        assert!("bob\n".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = PeerId::generate();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, format!("\"{}\"", original));
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_deserialize_rejects_empty() {
        assert!(serde_json::from_str::<PeerId>("\"\"").is_err());
    }
}
