//! Dual-copy message envelope.
//!
//! Every message is sealed twice under one shared nonce: once to the
//! receiver's public key and once to the sender's own public key, so that
//! either party can later open their own copy with nothing but their own
//! secret key. The two copies are cryptographically independent.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::aead::Nonce;
use crate::error::CryptoError;
use crate::hybrid::HybridCipher;
use crate::identity::Identity;
use crate::kem::{PublicKey, SecretKey};

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// One independently openable ciphertext pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedCopy {
    #[serde(with = "b64")]
    pub kem_ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub aead_ciphertext: Vec<u8>,
}

/// Which copy of an envelope a viewer is entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyRole {
    Receiver,
    Sender,
}

/// The persisted unit for one message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: Uuid,
    sender: Identity,
    receiver: Identity,
    nonce: Nonce,
    receiver_copy: SealedCopy,
    sender_copy: SealedCopy,
    timestamp: DateTime<Utc>,
}

/// Seal `plaintext` for both parties of a conversation.
///
/// Fails with [`CryptoError::KeyFormat`] if either public key is malformed;
/// no partial envelope is produced.
pub fn build_envelope(
    cipher: &HybridCipher,
    sender: &Identity,
    receiver: &Identity,
    plaintext: &[u8],
    own_public_key: &PublicKey,
    their_public_key: &PublicKey,
) -> Result<Envelope, CryptoError> {
    let nonce = Nonce::random()?;
    let for_receiver = cipher.seal_with_nonce(their_public_key, plaintext, nonce)?;
    let for_sender = cipher.seal_with_nonce(own_public_key, plaintext, nonce)?;

    Ok(Envelope {
        id: Uuid::new_v4(),
        sender: sender.clone(),
        receiver: receiver.clone(),
        nonce,
        receiver_copy: SealedCopy {
            kem_ciphertext: for_receiver.kem_ciphertext,
            aead_ciphertext: for_receiver.aead_ciphertext,
        },
        sender_copy: SealedCopy {
            kem_ciphertext: for_sender.kem_ciphertext,
            aead_ciphertext: for_sender.aead_ciphertext,
        },
        timestamp: Utc::now(),
    })
}

impl Envelope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> &Identity {
        &self.sender
    }

    pub fn receiver(&self) -> &Identity {
        &self.receiver
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    pub fn receiver_copy(&self) -> &SealedCopy {
        &self.receiver_copy
    }

    pub fn sender_copy(&self) -> &SealedCopy {
        &self.sender_copy
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Select the copy `viewer` may open.
    ///
    /// A message to oneself resolves to the receiver copy.
    pub fn resolve_copy(&self, viewer: &Identity) -> Result<(CopyRole, &SealedCopy), CryptoError> {
        if viewer == &self.receiver {
            Ok((CopyRole::Receiver, &self.receiver_copy))
        } else if viewer == &self.sender {
            Ok((CopyRole::Sender, &self.sender_copy))
        } else {
            Err(CryptoError::AccessDenied {
                viewer: viewer.to_string(),
            })
        }
    }

    /// Resolve the viewer's copy and open it with their secret key.
    pub fn open_for(
        &self,
        cipher: &HybridCipher,
        viewer: &Identity,
        secret_key: &SecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let (_, copy) = self.resolve_copy(viewer)?;
        cipher.open_sealed(&copy.kem_ciphertext, &copy.aead_ciphertext, &self.nonce, secret_key)
    }

    /// The live-forward payload. Carries only the receiver copy.
    pub fn delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            copy: self.receiver_copy.clone(),
            nonce: self.nonce,
            timestamp: self.timestamp,
        }
    }

    pub fn to_record(&self) -> EnvelopeRecord {
        EnvelopeRecord {
            id: self.id.to_string(),
            sender: self.sender.to_string(),
            receiver: self.receiver.to_string(),
            receiver_ciphertext_kem: STANDARD.encode(&self.receiver_copy.kem_ciphertext),
            receiver_ciphertext_aead: STANDARD.encode(&self.receiver_copy.aead_ciphertext),
            sender_ciphertext_kem: STANDARD.encode(&self.sender_copy.kem_ciphertext),
            sender_ciphertext_aead: STANDARD.encode(&self.sender_copy.aead_ciphertext),
            nonce: self.nonce.to_base64(),
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn from_record(record: &EnvelopeRecord) -> Result<Self, CryptoError> {
        Ok(Self {
            id: Uuid::parse_str(&record.id).map_err(|e| CryptoError::Encoding {
                field: "id",
                reason: e.to_string(),
            })?,
            sender: parse_identity("sender", &record.sender)?,
            receiver: parse_identity("receiver", &record.receiver)?,
            nonce: Nonce::from_base64(&record.nonce)?,
            receiver_copy: SealedCopy {
                kem_ciphertext: decode("receiverCiphertextKEM", &record.receiver_ciphertext_kem)?,
                aead_ciphertext: decode("receiverCiphertextAEAD", &record.receiver_ciphertext_aead)?,
            },
            sender_copy: SealedCopy {
                kem_ciphertext: decode("senderCiphertextKEM", &record.sender_ciphertext_kem)?,
                aead_ciphertext: decode("senderCiphertextAEAD", &record.sender_ciphertext_aead)?,
            },
            timestamp: DateTime::parse_from_rfc3339(&record.timestamp)
                .map_err(|e| CryptoError::Encoding {
                    field: "timestamp",
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc),
        })
    }
}

fn decode(field: &'static str, text: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD.decode(text).map_err(|e| CryptoError::Encoding {
        field,
        reason: e.to_string(),
    })
}

fn parse_identity(field: &'static str, text: &str) -> Result<Identity, CryptoError> {
    Identity::parse(text).map_err(|e| CryptoError::Encoding {
        field,
        reason: e.to_string(),
    })
}

/// Persisted text layout of an [`Envelope`]. Binary fields are base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub id: String,
    pub sender: String,
    pub receiver: String,
    #[serde(rename = "receiverCiphertextKEM")]
    pub receiver_ciphertext_kem: String,
    #[serde(rename = "receiverCiphertextAEAD")]
    pub receiver_ciphertext_aead: String,
    #[serde(rename = "senderCiphertextKEM")]
    pub sender_ciphertext_kem: String,
    #[serde(rename = "senderCiphertextAEAD")]
    pub sender_ciphertext_aead: String,
    pub nonce: String,
    pub timestamp: String,
}

/// What the relay forwards to an online receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub sender: Identity,
    pub receiver: Identity,
    pub copy: SealedCopy,
    pub nonce: Nonce,
    pub timestamp: DateTime<Utc>,
}

impl Delivery {
    pub fn open(
        &self,
        cipher: &HybridCipher,
        secret_key: &SecretKey,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        cipher.open_sealed(&self.copy.kem_ciphertext, &self.copy.aead_ciphertext, &self.nonce, secret_key)
    }
}
