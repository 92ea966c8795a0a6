//! User, device and server identities.
//!
//! A `FullIdentity` holds an Ed25519 signing key and never leaves the process
//! that owns it (except sealed, e.g. when a user admits one of its own
//! devices). `PublicIdentity` is the redacted projection shared with peers and
//! stored in team graphs.

use super::crypto::{self, CryptoError, SymmetricKey};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    User,
    Device,
    Server,
}

/// Identity with its secret signing key.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "FullIdentityRepr", into = "FullIdentityRepr")]
pub struct FullIdentity {
    pub kind: IdentityKind,
    pub id: String,
    pub name: String,
    signing_key: SigningKey,
}

/// Identity as seen by everyone else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub kind: IdentityKind,
    pub id: String,
    pub name: String,
    /// Hex-encoded Ed25519 verifying key.
    pub public_key: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FullIdentityRepr {
    kind: IdentityKind,
    id: String,
    name: String,
    secret_key: String,
}

impl TryFrom<FullIdentityRepr> for FullIdentity {
    type Error = CryptoError;

    fn try_from(repr: FullIdentityRepr) -> Result<Self, Self::Error> {
        let seed: [u8; 32] = crypto::decode_hex_array(&repr.secret_key)?;
        Ok(Self {
            kind: repr.kind,
            id: repr.id,
            name: repr.name,
            signing_key: SigningKey::from_bytes(&seed),
        })
    }
}

impl From<FullIdentity> for FullIdentityRepr {
    fn from(identity: FullIdentity) -> Self {
        Self {
            kind: identity.kind,
            secret_key: hex::encode(identity.signing_key.to_bytes()),
            id: identity.id,
            name: identity.name,
        }
    }
}

impl FullIdentity {
    pub fn generate(kind: IdentityKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::from_seed(kind, id, name, crypto::random_bytes())
    }

    /// Deterministic identity from a 32-byte seed.
    pub fn from_seed(
        kind: IdentityKind,
        id: impl Into<String>,
        name: impl Into<String>,
        seed: [u8; 32],
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Public projection of this identity.
    pub fn redact(&self) -> PublicIdentity {
        PublicIdentity {
            kind: self.kind,
            id: self.id.clone(),
            name: self.name.clone(),
            public_key: hex::encode(self.signing_key.verifying_key().to_bytes()),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Diffie-Hellman secret shared with `other`: both sides compute the same
    /// 32 bytes from their own signing key and the other's verifying key.
    pub fn shared_secret(&self, other: &PublicIdentity) -> crypto::Result<[u8; 32]> {
        let bytes: [u8; 32] = crypto::decode_hex_array(&other.public_key)?;
        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or_else(|| CryptoError::InvalidKey("not a curve point".to_string()))?;
        Ok((self.signing_key.to_scalar() * point).compress().to_bytes())
    }

    /// Local-only key for sealing data at rest. Never sent anywhere.
    pub fn storage_key(&self) -> crypto::Result<SymmetricKey> {
        SymmetricKey::derive(
            &self.signing_key.to_bytes(),
            b"repo-net/storage",
            self.id.as_bytes(),
        )
    }
}

impl std::fmt::Debug for FullIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullIdentity")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PublicIdentity {
    pub fn verifying_key(&self) -> crypto::Result<VerifyingKey> {
        let bytes: [u8; 32] = crypto::decode_hex_array(&self.public_key)?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> crypto::Result<()> {
        let signature =
            Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.verifying_key()?
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

/// New user identity. The user id is the user name.
pub fn create_user(name: &str) -> FullIdentity {
    FullIdentity::generate(IdentityKind::User, name, name)
}

/// New device identity belonging to `user_id`.
pub fn create_device(user_id: &str, device_name: &str) -> FullIdentity {
    FullIdentity::generate(
        IdentityKind::Device,
        format!("{}::{}", user_id, device_name),
        device_name,
    )
}

/// New server identity, identified by its host name.
pub fn create_server(host: &str) -> FullIdentity {
    FullIdentity::generate(IdentityKind::Server, host, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_keeps_public_fields() {
        let alice = create_user("alice");
        let public = alice.redact();
        assert_eq!(public.id, "alice");
        assert_eq!(public.kind, IdentityKind::User);
        assert_eq!(public.public_key.len(), 64);
        assert!(!serde_json::to_string(&public).unwrap().contains("secret"));
    }

    #[test]
    fn test_sign_and_verify() {
        let laptop = create_device("alice", "laptop");
        assert_eq!(laptop.id, "alice::laptop");
        let sig = laptop.sign(b"message");
        laptop.redact().verify(b"message", &sig).unwrap();
        assert!(laptop.redact().verify(b"other", &sig).is_err());
        assert!(create_device("alice", "phone").redact().verify(b"message", &sig).is_err());
    }

    #[test]
    fn test_bad_signature_bytes() {
        let server = create_server("sync.example.com");
        assert!(matches!(
            server.redact().verify(b"m", &[0u8; 3]),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn test_full_identity_serde_roundtrip() {
        let alice = create_user("alice");
        let json = serde_json::to_string(&alice).unwrap();
        assert!(json.contains("secretKey"));
        let back: FullIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.redact(), alice.redact());
    }

    #[test]
    fn test_shared_secret_agrees() {
        let a = create_device("alice", "laptop");
        let b = create_server("sync.example.com");
        assert_eq!(
            a.shared_secret(&b.redact()).unwrap(),
            b.shared_secret(&a.redact()).unwrap()
        );
        let c = create_device("carol", "phone");
        assert_ne!(
            a.shared_secret(&b.redact()).unwrap(),
            c.shared_secret(&b.redact()).unwrap()
        );
    }

    #[test]
    fn test_storage_key_is_stable_and_private() {
        let device = create_device("bob", "phone");
        let k1 = device.storage_key().unwrap();
        let k2 = device.storage_key().unwrap();
        assert_eq!(k1, k2);
        assert_ne!(k1, create_device("bob", "phone").storage_key().unwrap());
    }
}
