#![deny(unsafe_code)]

//! Cryptographic core of pqchat: KEM and AEAD capabilities, the hybrid
//! per-message cipher, and the dual-copy envelope codec.

pub mod error;
pub mod identity;

pub mod kem;
pub mod aead;
pub mod hybrid;

pub mod envelope;

pub use error::CryptoError;
pub use identity::Identity;
pub use kem::{Kem, KeyPair, PublicKey, SecretKey};
pub use aead::{Aead, Nonce};
pub use hybrid::{HybridCipher, SealedMessage};
pub use envelope::{build_envelope, CopyRole, Delivery, Envelope, EnvelopeRecord, SealedCopy};

#[cfg(test)]
mod proptests;
