//! Viewer-side chat session
//!
//! A session holds the unlocked secret key for one identity and turns
//! deliveries and history records into displayable messages. Anything the
//! key cannot open is shown as an opaque placeholder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use pqchat_crypto::{CryptoError, Delivery, Envelope, EnvelopeRecord, HybridCipher, Identity, SecretKey};

use crate::keystore::{KeyStore, KeyStoreError};

/// Shown in place of a message body the viewer cannot open.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "[unable to decrypt message]";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no local secret key for {0}; import or generate one first")]
    NoLocalKey(Identity),

    #[error(transparent)]
    KeyStore(KeyStoreError),
}

impl From<KeyStoreError> for SessionError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::MissingSecretKey(identity) => SessionError::NoLocalKey(identity),
            other => SessionError::KeyStore(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum MessageBody {
    Text(String),
    Undecryptable,
}

/// One message as the viewer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub sender: Identity,
    pub receiver: Identity,
    pub timestamp: DateTime<Utc>,
    /// Sent by the viewer.
    pub outgoing: bool,
    pub body: MessageBody,
}

impl MessageView {
    pub fn display_text(&self) -> &str {
        match &self.body {
            MessageBody::Text(text) => text,
            MessageBody::Undecryptable => UNDECRYPTABLE_PLACEHOLDER,
        }
    }

    /// The other party of the conversation.
    pub fn peer(&self) -> &Identity {
        if self.outgoing {
            &self.receiver
        } else {
            &self.sender
        }
    }
}

pub struct ChatSession {
    identity: Identity,
    secret_key: SecretKey,
    cipher: HybridCipher,
}

impl ChatSession {
    /// Unlock the stored secret key for `identity`.
    pub fn login(identity: Identity, keystore: &KeyStore, cipher: HybridCipher) -> Result<Self, SessionError> {
        let secret_key = keystore.unlock(&identity)?;
        debug!(%identity, "session unlocked");
        Ok(Self {
            identity,
            secret_key,
            cipher,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    fn body_from(&self, opened: Result<zeroize::Zeroizing<Vec<u8>>, CryptoError>, id: Uuid) -> MessageBody {
        match opened {
            Ok(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => MessageBody::Text(text.to_string()),
                Err(_) => {
                    warn!(%id, "message body is not UTF-8");
                    MessageBody::Undecryptable
                }
            },
            Err(e) => {
                debug!(%id, error = %e, "unable to open message");
                MessageBody::Undecryptable
            }
        }
    }

    /// Open a live delivery addressed to this session's identity.
    pub fn open_delivery(&self, delivery: &Delivery) -> MessageView {
        let opened = if delivery.receiver == self.identity {
            delivery.open(&self.cipher, &self.secret_key)
        } else {
            Err(CryptoError::AccessDenied {
                viewer: self.identity.to_string(),
            })
        };

        MessageView {
            id: delivery.id,
            sender: delivery.sender.clone(),
            receiver: delivery.receiver.clone(),
            timestamp: delivery.timestamp,
            outgoing: delivery.sender == self.identity,
            body: self.body_from(opened, delivery.id),
        }
    }

    /// Open one stored envelope using whichever copy belongs to the viewer.
    pub fn open_envelope(&self, envelope: &Envelope) -> MessageView {
        let opened = envelope.open_for(&self.cipher, &self.identity, &self.secret_key);
        MessageView {
            id: envelope.id(),
            sender: envelope.sender().clone(),
            receiver: envelope.receiver().clone(),
            timestamp: envelope.timestamp(),
            outgoing: envelope.sender() == &self.identity,
            body: self.body_from(opened, envelope.id()),
        }
    }

    /// Decode and open the history of the conversation with `peer`.
    ///
    /// Every record yields a view. One that fails to decode is shown as a
    /// placeholder, with whatever id and time it still carries.
    pub fn open_history(&self, peer: &Identity, records: &[EnvelopeRecord]) -> Vec<MessageView> {
        records
            .iter()
            .map(|record| match Envelope::from_record(record) {
                Ok(envelope) => self.open_envelope(&envelope),
                Err(e) => {
                    warn!(id = %record.id, error = %e, "malformed history record");
                    self.malformed_view(peer, record)
                }
            })
            .collect()
    }

    fn malformed_view(&self, peer: &Identity, record: &EnvelopeRecord) -> MessageView {
        let outgoing = record.sender == self.identity.as_str();
        let (sender, receiver) = if outgoing {
            (self.identity.clone(), peer.clone())
        } else {
            (peer.clone(), self.identity.clone())
        };
        MessageView {
            id: Uuid::parse_str(&record.id).unwrap_or_default(),
            sender,
            receiver,
            timestamp: DateTime::parse_from_rfc3339(&record.timestamp)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_default(),
            outgoing,
            body: MessageBody::Undecryptable,
        }
    }

    /// End the session and destroy the stored secret key.
    pub fn logout(self, keystore: &KeyStore) -> Result<(), SessionError> {
        keystore.wipe(&self.identity)?;
        debug!(identity = %self.identity, "logged out");
        Ok(())
    }
}
