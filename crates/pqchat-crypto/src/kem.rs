//! Key-encapsulation capability.
//!
//! The lattice arithmetic is consumed from `pqcrypto-kyber`; this module
//! only adapts it to the byte-oriented [`Kem`] trait and wraps the key
//! material in types that zeroize on drop.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// A published KEM public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        STANDARD
            .decode(text.trim())
            .map(Self)
            .map_err(|e| CryptoError::Encoding {
                field: "public_key",
                reason: e.to_string(),
            })
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("len", &self.0.len()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_base64(&text).map_err(serde::de::Error::custom)
    }
}

/// A KEM secret key. Never cloned implicitly, never printed, zeroed on drop.
pub struct SecretKey(Zeroizing<Vec<u8>>);

impl SecretKey {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Borrow the raw key bytes. Callers must not copy them into
    /// unmanaged buffers.
    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0.as_slice()))
    }

    pub fn from_base64(text: &str) -> Result<Self, CryptoError> {
        STANDARD
            .decode(text.trim())
            .map(Self::from_bytes)
            .map_err(|e| CryptoError::Encoding {
                field: "secret_key",
                reason: e.to_string(),
            })
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Freshly generated key material.
#[derive(Debug)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: SecretKey,
}

/// Ephemeral symmetric key produced by one encapsulation or decapsulation.
///
/// Used for exactly one seal or open and zeroed when dropped.
pub struct SessionKey(Zeroizing<Vec<u8>>);

impl SessionKey {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    pub fn expose_secret(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// A key-encapsulation mechanism with fixed, queryable sizes.
pub trait Kem: Send + Sync {
    fn algorithm(&self) -> &'static str;
    fn public_key_len(&self) -> usize;
    fn secret_key_len(&self) -> usize;
    fn ciphertext_len(&self) -> usize;
    fn shared_secret_len(&self) -> usize;

    fn generate_keypair(&self) -> Result<KeyPair, CryptoError>;

    /// Encapsulate a fresh shared secret to `public_key`.
    ///
    /// Returns the KEM ciphertext and the shared secret. A malformed or
    /// empty key yields [`CryptoError::KeyFormat`].
    fn encapsulate(&self, public_key: &PublicKey) -> Result<(Vec<u8>, SessionKey), CryptoError>;

    /// Recover the shared secret from `ciphertext` with `secret_key`.
    fn decapsulate(&self, ciphertext: &[u8], secret_key: &SecretKey)
        -> Result<SessionKey, CryptoError>;

    /// The public half of a stored secret key.
    fn public_key_from_secret(&self, secret_key: &SecretKey) -> Result<PublicKey, CryptoError>;
}

/// Overwrite a pqcrypto key or shared secret in place.
///
/// Those types are `Copy` newtypes over byte arrays with no zeroize support,
/// so the copies we hold are cleared by hand once their bytes are re-wrapped.
#[allow(unsafe_code)]
fn wipe<T: Copy>(value: &mut T) {
    // SAFETY: only called with pqcrypto's fixed-size byte-array newtypes,
    // which hold no references and for which all-zero bytes are valid.
    unsafe { zeroize::zeroize_flat_type(value as *mut T) }
}

fn check_len(what: &'static str, expected: usize, got: usize) -> Result<(), CryptoError> {
    if expected != got {
        return Err(CryptoError::KeyFormat { what, expected, got });
    }
    Ok(())
}

macro_rules! kyber_kem {
    ($(#[$meta:meta])* $name:ident, $module:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Kem for $name {
            fn algorithm(&self) -> &'static str {
                $label
            }

            fn public_key_len(&self) -> usize {
                pqcrypto_kyber::$module::public_key_bytes()
            }

            fn secret_key_len(&self) -> usize {
                pqcrypto_kyber::$module::secret_key_bytes()
            }

            fn ciphertext_len(&self) -> usize {
                pqcrypto_kyber::$module::ciphertext_bytes()
            }

            fn shared_secret_len(&self) -> usize {
                pqcrypto_kyber::$module::shared_secret_bytes()
            }

            fn generate_keypair(&self) -> Result<KeyPair, CryptoError> {
                use pqcrypto_traits::kem::{PublicKey as _, SecretKey as _};

                let (pk, mut sk) = pqcrypto_kyber::$module::keypair();
                let secret_key = SecretKey::from_bytes(sk.as_bytes().to_vec());
                wipe(&mut sk);
                Ok(KeyPair {
                    public_key: PublicKey::from_bytes(pk.as_bytes()),
                    secret_key,
                })
            }

            fn encapsulate(
                &self,
                public_key: &PublicKey,
            ) -> Result<(Vec<u8>, SessionKey), CryptoError> {
                use pqcrypto_traits::kem::{
                    Ciphertext as _, PublicKey as _, SharedSecret as _,
                };

                check_len("public key", self.public_key_len(), public_key.len())?;
                let pk = pqcrypto_kyber::$module::PublicKey::from_bytes(public_key.as_bytes())
                    .map_err(|_| CryptoError::KeyFormat {
                        what: "public key",
                        expected: self.public_key_len(),
                        got: public_key.len(),
                    })?;

                let (mut ss, ct) = pqcrypto_kyber::$module::encapsulate(&pk);
                let session_key = SessionKey::from_bytes(ss.as_bytes());
                wipe(&mut ss);
                Ok((ct.as_bytes().to_vec(), session_key))
            }

            fn decapsulate(
                &self,
                ciphertext: &[u8],
                secret_key: &SecretKey,
            ) -> Result<SessionKey, CryptoError> {
                use pqcrypto_traits::kem::{
                    Ciphertext as _, SecretKey as _, SharedSecret as _,
                };

                if secret_key.len() != self.secret_key_len()
                    || ciphertext.len() != self.ciphertext_len()
                {
                    return Err(CryptoError::KemMismatch);
                }
                let ct = pqcrypto_kyber::$module::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| CryptoError::KemMismatch)?;
                let mut sk = pqcrypto_kyber::$module::SecretKey::from_bytes(secret_key.expose_secret())
                    .map_err(|_| CryptoError::KemMismatch)?;

                let mut ss = pqcrypto_kyber::$module::decapsulate(&ct, &sk);
                wipe(&mut sk);
                let session_key = SessionKey::from_bytes(ss.as_bytes());
                wipe(&mut ss);
                Ok(session_key)
            }

            fn public_key_from_secret(&self, secret_key: &SecretKey) -> Result<PublicKey, CryptoError> {
                check_len("secret key", self.secret_key_len(), secret_key.len())?;
                // Kyber secret key layout: indcpa key || pk || H(pk) || z
                let end = self.secret_key_len() - 64;
                let start = end - self.public_key_len();
                Ok(PublicKey::from_bytes(&secret_key.expose_secret()[start..end]))
            }
        }
    };
}

kyber_kem!(
    /// Kyber-512 (NIST security category 1).
    Kyber512,
    kyber512,
    "kyber512"
);

kyber_kem!(
    /// Kyber-768 (NIST security category 3). The default parameter set.
    Kyber768,
    kyber768,
    "kyber768"
);

/// Resolve a KEM by its configured name.
pub fn kem_by_name(name: &str) -> Option<Box<dyn Kem>> {
    match name {
        "kyber512" | "ml-kem-512" => Some(Box::new(Kyber512)),
        "kyber768" | "ml-kem-768" => Some(Box::new(Kyber768)),
        _ => None,
    }
}
