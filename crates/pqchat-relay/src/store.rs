//! Message store abstraction for persisted envelopes.
//!
//! This module defines the `MessageStore` trait and an in-memory
//! implementation for tests and single-process deployments. The durable
//! SQLite backend lives in [`crate::sqlite_store`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use pqchat_crypto::{Envelope, Identity};
use uuid::Uuid;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during store operations.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Append-only envelope persistence.
///
/// Implementations must preserve insertion order: envelopes appended one
/// after another come back from `query_range` in that order.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist one envelope. Envelopes are immutable, so appending the same
    /// id twice is an error.
    async fn append(&self, envelope: &Envelope) -> Result<(), StoreError>;

    /// Every envelope exchanged between `a` and `b` in either direction,
    /// oldest first.
    async fn query_range(&self, a: &Identity, b: &Identity) -> Result<Vec<Envelope>, StoreError>;
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory store backed by a vector in insertion order.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    inner: Arc<RwLock<Stored>>,
}

#[derive(Default)]
struct Stored {
    envelopes: Vec<Envelope>,
    ids: HashSet<Uuid>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored envelopes.
    pub async fn len(&self) -> usize {
        self.inner.read().await.envelopes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.envelopes.is_empty()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn append(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let mut stored = self.inner.write().await;
        if !stored.ids.insert(envelope.id()) {
            return Err(StoreError::AlreadyExists(envelope.id().to_string()));
        }
        stored.envelopes.push(envelope.clone());
        Ok(())
    }

    async fn query_range(&self, a: &Identity, b: &Identity) -> Result<Vec<Envelope>, StoreError> {
        let stored = self.inner.read().await;
        Ok(stored
            .envelopes
            .iter()
            .filter(|e| in_conversation(e, a, b))
            .cloned()
            .collect())
    }
}

pub(crate) fn in_conversation(envelope: &Envelope, a: &Identity, b: &Identity) -> bool {
    (envelope.sender() == a && envelope.receiver() == b)
        || (envelope.sender() == b && envelope.receiver() == a)
}
