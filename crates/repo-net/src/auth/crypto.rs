//! Symmetric primitives for team secrets and session tunnels.
//!
//! Ciphertexts are `[nonce: 24 bytes][ciphertext + tag]` under
//! XChaCha20-Poly1305. Keys are derived with HKDF-SHA256.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed")]
    Decrypt,

    #[error("Ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("Key derivation failed")]
    Derive,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid signature")]
    BadSignature,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Fill a fixed-size array from the thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// HKDF-SHA256 expansion of `ikm` into a new key.
    pub fn derive(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
        let mut okm = [0u8; KEY_SIZE];
        hkdf.expand(info, &mut okm).map_err(|_| CryptoError::Derive)?;
        Ok(Self(okm))
    }

    fn cipher(&self) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
        let ciphertext = self
            .cipher()?
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(..)")
    }
}

/// Decode a hex string into a fixed-size array.
pub fn decode_hex_array<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("expected {} bytes, got {}", N, v.len())))
}

impl Serialize for SymmetricKey {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        decode_hex_array(&s).map(Self).map_err(serde::de::Error::custom)
    }
}
