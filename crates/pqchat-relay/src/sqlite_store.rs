//! SQLite-based persistent storage for envelopes and published keys.
//!
//! Envelopes are stored in their text record layout, keyed by an
//! autoincrement sequence that defines insertion order. All statements run
//! on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use pqchat_crypto::{Envelope, EnvelopeRecord, Identity, PublicKey};

use crate::directory::{DirectoryError, KeyDirectory};
use crate::store::{MessageStore, StoreError};

// ============================================================================
// Schema Version
// ============================================================================

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

// ============================================================================
// SQLite Store Implementation
// ============================================================================

/// SQLite store implementing both [`MessageStore`] and [`KeyDirectory`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path).map_err(|e| {
            StoreError::OperationFailed(format!("failed to open database: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, mainly for tests.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {}", e)))?;

        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {}", e)))?;

        if current_version > SCHEMA_VERSION {
            return Err(StoreError::DataCorruption(format!(
                "database schema version {} is newer than supported {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        Ok(())
    }

    /// Initial schema. Applied as one transaction.
    fn migrate_v1(conn: &mut Connection) -> Result<(), StoreError> {
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::OperationFailed(format!("failed to begin migration: {}", e)))?;
        tx.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS envelopes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                sender TEXT NOT NULL,
                receiver TEXT NOT NULL,
                receiver_ciphertext_kem TEXT NOT NULL,
                receiver_ciphertext_aead TEXT NOT NULL,
                sender_ciphertext_kem TEXT NOT NULL,
                sender_ciphertext_aead TEXT NOT NULL,
                nonce TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_envelopes_pair
                ON envelopes (sender, receiver, seq);

            CREATE TABLE IF NOT EXISTS public_keys (
                identity TEXT PRIMARY KEY,
                public_key BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {}", e)))?;
        tx.commit()
            .map_err(|e| StoreError::OperationFailed(format!("failed to commit migration: {}", e)))
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::OperationFailed("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::OperationFailed(format!("storage task failed: {}", e)))?
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<EnvelopeRecord> {
        Ok(EnvelopeRecord {
            id: row.get(0)?,
            sender: row.get(1)?,
            receiver: row.get(2)?,
            receiver_ciphertext_kem: row.get(3)?,
            receiver_ciphertext_aead: row.get(4)?,
            sender_ciphertext_kem: row.get(5)?,
            sender_ciphertext_aead: row.get(6)?,
            nonce: row.get(7)?,
            timestamp: row.get(8)?,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, envelope: &Envelope) -> Result<(), StoreError> {
        let record = envelope.to_record();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO envelopes (
                    id, sender, receiver,
                    receiver_ciphertext_kem, receiver_ciphertext_aead,
                    sender_ciphertext_kem, sender_ciphertext_aead,
                    nonce, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.sender,
                    record.receiver,
                    record.receiver_ciphertext_kem,
                    record.receiver_ciphertext_aead,
                    record.sender_ciphertext_kem,
                    record.sender_ciphertext_aead,
                    record.nonce,
                    record.timestamp,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref err, _)
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    StoreError::AlreadyExists(record.id.clone())
                }
                other => StoreError::OperationFailed(format!("failed to append envelope: {}", other)),
            })?;
            Ok(())
        })
        .await
    }

    async fn query_range(&self, a: &Identity, b: &Identity) -> Result<Vec<Envelope>, StoreError> {
        let a = a.to_string();
        let b = b.to_string();
        let records = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT id, sender, receiver,
                                receiver_ciphertext_kem, receiver_ciphertext_aead,
                                sender_ciphertext_kem, sender_ciphertext_aead,
                                nonce, timestamp
                         FROM envelopes
                         WHERE (sender = ?1 AND receiver = ?2)
                            OR (sender = ?2 AND receiver = ?1)
                         ORDER BY seq ASC",
                    )
                    .map_err(|e| StoreError::OperationFailed(format!("failed to prepare query: {}", e)))?;

                let rows = stmt
                    .query_map(params![a, b], Self::row_to_record)
                    .map_err(|e| StoreError::OperationFailed(format!("failed to query envelopes: {}", e)))?;

                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| StoreError::OperationFailed(format!("failed to read envelope row: {}", e)))
            })
            .await?;

        records
            .iter()
            .map(|record| {
                Envelope::from_record(record)
                    .map_err(|e| StoreError::DataCorruption(format!("envelope {}: {}", record.id, e)))
            })
            .collect()
    }
}

#[async_trait]
impl KeyDirectory for SqliteStore {
    async fn register(&self, identity: &Identity, key: PublicKey) -> Result<(), DirectoryError> {
        let identity = identity.to_string();
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO public_keys (identity, public_key, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(identity) DO UPDATE SET
                    public_key = excluded.public_key,
                    updated_at = excluded.updated_at",
                params![identity, key.as_bytes(), updated_at],
            )
            .map_err(|e| StoreError::OperationFailed(format!("failed to register key: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }

    async fn lookup(&self, identity: &Identity) -> Result<Option<PublicKey>, DirectoryError> {
        let identity = identity.to_string();
        let bytes = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT public_key FROM public_keys WHERE identity = ?1",
                    params![identity],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
                .map_err(|e| StoreError::OperationFailed(format!("failed to look up key: {}", e)))
            })
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

        Ok(bytes.map(PublicKey::from_bytes))
    }
}
