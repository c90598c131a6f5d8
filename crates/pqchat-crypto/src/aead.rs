//! Authenticated encryption capability.
//!
//! Both suites take a 256-bit key and a 96-bit nonce, so either pairs with
//! a KEM that yields 32-byte shared secrets. Neither uses associated data.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::aead::{Aead as _, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroizing;

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::CryptoError;
use crate::kem::SessionKey;

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// A 96-bit AEAD nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Draw a fresh nonce from the operating system RNG.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut bytes).map_err(|_| CryptoError::Rng)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| CryptoError::Encoding {
            field: "nonce",
            reason: format!("expected {} bytes, got {}", NONCE_LEN, bytes.len()),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD.decode(text).map_err(|e| CryptoError::Encoding {
            field: "nonce",
            reason: e.to_string(),
        })?;
        Self::from_slice(&bytes)
    }
}

impl serde::Serialize for Nonce {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> serde::Deserialize<'de> for Nonce {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// An AEAD cipher keyed per call.
pub trait Aead: Send + Sync {
    fn algorithm(&self) -> &'static str;
    fn key_len(&self) -> usize;

    /// Encrypt `plaintext`, returning ciphertext with the tag appended.
    fn seal(&self, key: &SessionKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Authenticate and decrypt. Any failure is [`CryptoError::Decryption`].
    fn open(
        &self,
        key: &SessionKey,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// AES-256 in Galois/Counter Mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aes256GcmAead;

impl Aead for Aes256GcmAead {
    fn algorithm(&self) -> &'static str {
        "aes-256-gcm"
    }

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn seal(&self, key: &SessionKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
            .map_err(|_| CryptoError::Encryption)?;
        cipher
            .encrypt(aes_gcm::Nonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| CryptoError::Encryption)
    }

    fn open(
        &self,
        key: &SessionKey,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
            .map_err(|_| CryptoError::Decryption)?;
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decryption)
    }
}

/// ChaCha20-Poly1305 (RFC 8439).
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaCha20Poly1305Aead;

impl Aead for ChaCha20Poly1305Aead {
    fn algorithm(&self) -> &'static str {
        "chacha20-poly1305"
    }

    fn key_len(&self) -> usize {
        KEY_LEN
    }

    fn seal(&self, key: &SessionKey, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret())
            .map_err(|_| CryptoError::Encryption)?;
        cipher
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), plaintext)
            .map_err(|_| CryptoError::Encryption)
    }

    fn open(
        &self,
        key: &SessionKey,
        nonce: &Nonce,
        ciphertext: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret())
            .map_err(|_| CryptoError::Decryption)?;
        cipher
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce.as_bytes()), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Decryption)
    }
}

/// Resolve an AEAD by its configured name.
pub fn aead_by_name(name: &str) -> Option<Box<dyn Aead>> {
    match name {
        "aes-256-gcm" => Some(Box::new(Aes256GcmAead)),
        "chacha20-poly1305" => Some(Box::new(ChaCha20Poly1305Aead)),
        _ => None,
    }
}
