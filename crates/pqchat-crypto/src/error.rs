//! Error type shared by every cryptographic operation in this crate.

/// Failures surfaced by the KEM, AEAD, hybrid cipher and envelope codec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    /// A public or secret key had the wrong length or was empty.
    #[error("malformed {what}: expected {expected} bytes, got {got}")]
    KeyFormat {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    /// KEM decapsulation failed (wrong key or corrupted ciphertext).
    #[error("kem decapsulation failed")]
    KemMismatch,
    /// AEAD authentication failed.
    #[error("decryption failed")]
    Decryption,
    #[error("encryption failed")]
    Encryption,
    #[error("incompatible suite: kem yields {secret_len}-byte secrets, aead needs {key_len}-byte keys")]
    IncompatibleSuite { secret_len: usize, key_len: usize },
    /// The viewer is neither the sender nor the receiver of an envelope.
    #[error("{viewer} may not open this envelope")]
    AccessDenied { viewer: String },
    #[error("invalid encoding of {field}: {reason}")]
    Encoding { field: &'static str, reason: String },
    #[error("key generation failed")]
    KeyGeneration,
    #[error("random number generator unavailable")]
    Rng,
}

impl CryptoError {
    /// True for failures that a viewer renders as an undecryptable message
    /// rather than treating as a fault.
    pub fn is_undecryptable(&self) -> bool {
        matches!(
            self,
            CryptoError::KemMismatch | CryptoError::Decryption | CryptoError::AccessDenied { .. }
        )
    }
}
