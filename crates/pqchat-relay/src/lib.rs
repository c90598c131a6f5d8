//! pqchat-relay: presence-based relay for pqchat
//!
//! Clients authenticate over QUIC with a signed session token. For every
//! message the relay seals a copy for the receiver and one for the sender,
//! persists the envelope and forwards the receiver copy if they are online.

pub mod admin;
pub mod auth;
pub mod config;
pub mod directory;
pub mod metrics;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod server;
pub mod sqlite_store;
pub mod store;

pub use auth::{AuthError, Authenticator, SessionToken, TokenAuthenticator, TokenIssuer};
pub use config::ServerConfig;
pub use directory::{InMemoryKeyDirectory, KeyDirectory};
pub use presence::{Endpoint, PresenceDirectory};
pub use protocol::{ClientFrame, FrameCodec, ServerFrame};
pub use router::{ConnectionContext, RelayError, RelayRouter, SendReport};
pub use server::RelayServer;
pub use sqlite_store::SqliteStore;
pub use store::{InMemoryMessageStore, MessageStore, StoreError};
