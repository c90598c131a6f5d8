//! pqchat client
//!
//! Keeps the KEM secret key on this device, talks to the relay over QUIC and
//! opens whichever copy of each message belongs to the signed-in identity.

pub mod cli;
pub mod config;
pub mod connection;
pub mod keystore;
pub mod output;
pub mod session;

#[cfg(test)]
mod proptests;

pub use cli::Cli;
pub use config::Config;
pub use connection::{ConnectionError, RelayConnection};
pub use keystore::{
    FileSecretStorage, KeyExport, KeyStore, KeyStoreError, MemorySecretStorage, PendingKey, SecretStorage,
};
pub use output::{OutputFormat, OutputFormatter};
pub use session::{ChatSession, MessageBody, MessageView, SessionError};

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    /// Token missing, invalid or rejected by the relay
    AuthenticationFailed = 2,
    Timeout = 3,
    ConnectionFailed = 4,
    InvalidInput = 5,
    /// No secret key on this device for the identity
    NoLocalKey = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GeneralError => "GENERAL_ERROR",
            ExitCode::AuthenticationFailed => "AUTH_FAILED",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::ConnectionFailed => "CONNECTION_FAILED",
            ExitCode::InvalidInput => "INVALID_INPUT",
            ExitCode::NoLocalKey => "NO_LOCAL_KEY",
        }
    }
}
