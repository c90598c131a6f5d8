//! Public key directory.
//!
//! Maps identities to their published KEM public keys. Registration is
//! bound to the authenticated identity by the router; this layer only
//! stores and returns keys.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use pqchat_crypto::{Identity, PublicKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt directory entry for {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish or replace the public key for `identity`.
    async fn register(&self, identity: &Identity, key: PublicKey) -> Result<(), DirectoryError>;

    /// Returns `Ok(None)` for identities that never registered a key.
    async fn lookup(&self, identity: &Identity) -> Result<Option<PublicKey>, DirectoryError>;
}

/// Directory kept entirely in memory.
#[derive(Default)]
pub struct InMemoryKeyDirectory {
    keys: DashMap<Identity, PublicKey>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn register(&self, identity: &Identity, key: PublicKey) -> Result<(), DirectoryError> {
        self.keys.insert(identity.clone(), key);
        Ok(())
    }

    async fn lookup(&self, identity: &Identity) -> Result<Option<PublicKey>, DirectoryError> {
        Ok(self.keys.get(identity).map(|entry| entry.value().clone()))
    }
}
