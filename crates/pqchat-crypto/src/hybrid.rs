//! Hybrid per-message cipher: KEM encapsulation followed by AEAD sealing.
//!
//! The KEM shared secret is the AEAD key directly, so the two capabilities
//! must agree on its length. The session key lives only for the duration
//! of one seal or open and is zeroed when it goes out of scope.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::aead::{Aead, Aes256GcmAead, Nonce};
use crate::error::CryptoError;
use crate::kem::{Kem, Kyber768, PublicKey, SecretKey};

/// Output of one encapsulate-and-seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub kem_ciphertext: Vec<u8>,
    pub aead_ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

/// A KEM paired with an AEAD whose key size matches the KEM secret size.
#[derive(Clone)]
pub struct HybridCipher {
    kem: Arc<dyn Kem>,
    aead: Arc<dyn Aead>,
}

impl HybridCipher {
    pub fn new(kem: Arc<dyn Kem>, aead: Arc<dyn Aead>) -> Result<Self, CryptoError> {
        if kem.shared_secret_len() != aead.key_len() {
            return Err(CryptoError::IncompatibleSuite {
                secret_len: kem.shared_secret_len(),
                key_len: aead.key_len(),
            });
        }
        Ok(Self { kem, aead })
    }

    /// Kyber-768 with AES-256-GCM.
    pub fn default_suite() -> Self {
        Self {
            kem: Arc::new(Kyber768),
            aead: Arc::new(Aes256GcmAead),
        }
    }

    /// Build a cipher from configured algorithm names.
    pub fn from_names(kem: &str, aead: &str) -> Result<Self, CryptoError> {
        let kem = crate::kem::kem_by_name(kem).ok_or_else(|| CryptoError::Encoding {
            field: "kem",
            reason: format!("unknown algorithm {kem}"),
        })?;
        let aead = crate::aead::aead_by_name(aead).ok_or_else(|| CryptoError::Encoding {
            field: "aead",
            reason: format!("unknown algorithm {aead}"),
        })?;
        Self::new(Arc::from(kem), Arc::from(aead))
    }

    pub fn kem(&self) -> &dyn Kem {
        self.kem.as_ref()
    }

    pub fn aead(&self) -> &dyn Aead {
        self.aead.as_ref()
    }

    /// Encapsulate to `recipient` and seal `plaintext` under a fresh nonce.
    pub fn encapsulate_and_seal(
        &self,
        recipient: &PublicKey,
        plaintext: &[u8],
    ) -> Result<SealedMessage, CryptoError> {
        let nonce = Nonce::random()?;
        self.seal_with_nonce(recipient, plaintext, nonce)
    }

    /// Seal under a caller-chosen nonce.
    ///
    /// The nonce must never repeat under the same session key. Every call
    /// encapsulates a fresh session key, so sharing one nonce between the
    /// two copies of an envelope stays within that rule.
    pub(crate) fn seal_with_nonce(
        &self,
        recipient: &PublicKey,
        plaintext: &[u8],
        nonce: Nonce,
    ) -> Result<SealedMessage, CryptoError> {
        let (kem_ciphertext, session_key) = self.kem.encapsulate(recipient)?;
        let aead_ciphertext = self.aead.seal(&session_key, &nonce, plaintext)?;
        drop(session_key);

        Ok(SealedMessage {
            kem_ciphertext,
            aead_ciphertext,
            nonce,
        })
    }

    /// Decapsulate with `secret_key` and open the AEAD ciphertext.
    pub fn open_sealed(
        &self,
        kem_ciphertext: &[u8],
        aead_ciphertext: &[u8],
        nonce: &Nonce,
        secret_key: &SecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let session_key = self.kem.decapsulate(kem_ciphertext, secret_key)?;
        self.aead.open(&session_key, nonce, aead_ciphertext)
    }
}

impl std::fmt::Debug for HybridCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCipher")
            .field("kem", &self.kem.algorithm())
            .field("aead", &self.aead.algorithm())
            .finish()
    }
}
