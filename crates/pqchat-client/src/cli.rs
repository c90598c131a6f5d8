//! CLI command definitions and argument parsing

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use pqchat_crypto::Identity;
use pqchat_relay::protocol::ServerFrame;

use crate::config::Config;
use crate::connection::{ConnectionError, RelayConnection};
use crate::keystore::{FileSecretStorage, KeyStore};
use crate::output::{OutputFormat, OutputFormatter};
use crate::session::{ChatSession, SessionError};
use crate::ExitCode;

/// pqchat - end-to-end encrypted messaging over a post-quantum relay
#[derive(Parser, Debug)]
#[command(name = "pqchat")]
#[command(version, about = "pqchat - end-to-end encrypted messaging over a post-quantum relay")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Identity to act as
    #[arg(long, short = 'i', env = "PQCHAT_IDENTITY", global = true)]
    pub identity: Option<String>,

    /// Session token (overrides relay.token from the config file)
    #[arg(long, env = "PQCHAT_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a key pair locally and print the public key
    Keygen {
        /// Replace an existing key. Messages sealed to the old key become unreadable.
        #[arg(long)]
        force: bool,
    },
    /// Publish the public key to the relay, generating a key pair if none exists
    Register {
        /// Publish a new key pair instead of the stored one. The old key is
        /// kept until the relay accepts the new one.
        #[arg(long)]
        force: bool,
    },
    /// Write the secret key to `<identity>_private_key.txt`
    Export {
        /// Destination directory
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Restore a secret key from an exported file
    Import { file: PathBuf },
    /// Delete the local secret key
    Logout,
    /// Send a message
    Send { to: String, message: String },
    /// Print incoming messages until interrupted
    Listen,
    /// Show the conversation with a peer
    History { peer: String },
}

/// Everything a command needs once the config is resolved.
struct CommandContext {
    config: Config,
    keystore: KeyStore,
    formatter: OutputFormatter,
    token: Option<String>,
}

impl CommandContext {
    fn token(&self) -> anyhow::Result<&str> {
        self.token
            .as_deref()
            .or(self.config.relay.token.as_deref())
            .filter(|t| !t.is_empty())
            .context("no session token; pass --token or set relay.token in the config")
    }

    async fn connect(&self) -> Result<RelayConnection, ExitCode> {
        let token = match self.token() {
            Ok(token) => token,
            Err(e) => {
                self.formatter.error(&e.to_string());
                return Err(ExitCode::AuthenticationFailed);
            }
        };
        self.formatter
            .progress(&format!("Connecting to {}...", self.config.relay.address));
        RelayConnection::connect(&self.config, token).await.map_err(|e| {
            self.formatter.error(&e.to_string());
            connection_exit_code(&e)
        })
    }

    fn login(&self, identity: &Identity) -> Result<ChatSession, ExitCode> {
        ChatSession::login(identity.clone(), &self.keystore, self.keystore.cipher().clone()).map_err(|e| {
            self.formatter.error(&e.to_string());
            match e {
                SessionError::NoLocalKey(_) => ExitCode::NoLocalKey,
                SessionError::KeyStore(_) => ExitCode::GeneralError,
            }
        })
    }
}

fn connection_exit_code(e: &ConnectionError) -> ExitCode {
    match e {
        ConnectionError::Rejected(_) => ExitCode::AuthenticationFailed,
        ConnectionError::Timeout => ExitCode::Timeout,
        ConnectionError::Config(_) | ConnectionError::MessageTooLarge { .. } => ExitCode::InvalidInput,
        _ => ExitCode::ConnectionFailed,
    }
}

macro_rules! bail_code {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(code) => return Ok(code),
        }
    };
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let formatter = OutputFormatter::new(self.output, self.verbose);

        let Some(identity) = self.identity.as_deref() else {
            formatter.error("no identity given; pass --identity or set PQCHAT_IDENTITY");
            return Ok(ExitCode::InvalidInput);
        };
        let identity = match Identity::parse(identity) {
            Ok(identity) => identity,
            Err(e) => {
                formatter.error(&format!("invalid identity: {e}"));
                return Ok(ExitCode::InvalidInput);
            }
        };

        let cipher = config.build_cipher().context("invalid cipher suite")?;
        let key_dir = config
            .key_dir()
            .context("no key directory configured and no platform data directory")?;
        debug!(key_dir = %key_dir.display(), "using key directory");

        let ctx = CommandContext {
            keystore: KeyStore::new(FileSecretStorage::new(key_dir), cipher),
            config,
            formatter,
            token: self.token,
        };

        match self.command {
            Commands::Keygen { force } => keygen(&ctx, &identity, force),
            Commands::Register { force } => register(&ctx, &identity, force).await,
            Commands::Export { out_dir } => export(&ctx, &identity, &out_dir),
            Commands::Import { file } => import(&ctx, &identity, &file),
            Commands::Logout => logout(&ctx, &identity),
            Commands::Send { to, message } => send(&ctx, &identity, &to, &message).await,
            Commands::Listen => listen(&ctx, &identity).await,
            Commands::History { peer } => history(&ctx, &identity, &peer).await,
        }
    }
}

fn keygen(ctx: &CommandContext, identity: &Identity, force: bool) -> anyhow::Result<ExitCode> {
    if ctx.keystore.has_key(identity) && !force {
        ctx.formatter
            .error(&format!("a key for {identity} already exists; use --force to replace it"));
        return Ok(ExitCode::InvalidInput);
    }
    let public_key = ctx.keystore.generate(identity)?;
    println!(
        "{}",
        ctx.formatter
            .format_public_key(identity.as_str(), ctx.keystore.cipher().kem().algorithm(), &public_key)
    );
    Ok(ExitCode::Success)
}

/// Publish the stored key, or a new one that is only kept once the relay
/// acknowledges it.
async fn register(ctx: &CommandContext, identity: &Identity, force: bool) -> anyhow::Result<ExitCode> {
    let mut conn = bail_code!(ctx.connect().await);
    if conn.identity() != identity {
        ctx.formatter.error(&format!(
            "token is for {} but --identity is {}",
            conn.identity(),
            identity
        ));
        conn.close().await;
        return Ok(ExitCode::AuthenticationFailed);
    }

    let pending = if ctx.keystore.has_key(identity) && !force {
        None
    } else {
        Some(ctx.keystore.prepare(identity)?)
    };
    let public_key = match &pending {
        Some(pending) => pending.public_key().clone(),
        None => ctx.keystore.public_key(identity)?,
    };
    let result = conn.register_key(&public_key).await;
    conn.close().await;

    match result {
        Ok(()) => {
            let note = match pending {
                Some(pending) => {
                    ctx.keystore.commit(pending)?;
                    "new"
                }
                None => "existing",
            };
            ctx.formatter
                .success(&format!("Registered {note} public key for {identity}"));
            Ok(ExitCode::Success)
        }
        Err(e) => {
            ctx.formatter.error(&format!("registration failed: {e}"));
            Ok(connection_exit_code(&e))
        }
    }
}

fn export(ctx: &CommandContext, identity: &Identity, out_dir: &std::path::Path) -> anyhow::Result<ExitCode> {
    let session = bail_code!(ctx.login(identity));
    let path = ctx.keystore.export_to_file(session.identity(), out_dir)?;
    ctx.formatter
        .success(&format!("Secret key written to {}. Keep it private.", path.display()));
    Ok(ExitCode::Success)
}

fn import(ctx: &CommandContext, identity: &Identity, file: &std::path::Path) -> anyhow::Result<ExitCode> {
    let artifact = zeroize::Zeroizing::new(
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?,
    );
    match ctx.keystore.import(identity, &artifact) {
        Ok(()) => {
            ctx.formatter.success(&format!("Imported secret key for {identity}"));
            Ok(ExitCode::Success)
        }
        Err(e) => {
            ctx.formatter.error(&format!("import failed: {e}"));
            Ok(ExitCode::InvalidInput)
        }
    }
}

fn logout(ctx: &CommandContext, identity: &Identity) -> anyhow::Result<ExitCode> {
    let session = bail_code!(ctx.login(identity));
    session.logout(&ctx.keystore)?;
    ctx.formatter
        .success(&format!("Secret key for {identity} deleted from this device"));
    Ok(ExitCode::Success)
}

async fn send(ctx: &CommandContext, identity: &Identity, to: &str, message: &str) -> anyhow::Result<ExitCode> {
    let _session = bail_code!(ctx.login(identity));
    let receiver = match Identity::parse(to) {
        Ok(receiver) => receiver,
        Err(e) => {
            ctx.formatter.error(&format!("invalid receiver: {e}"));
            return Ok(ExitCode::InvalidInput);
        }
    };

    let mut conn = bail_code!(ctx.connect().await);
    let result = conn.send_message(&receiver, message).await;
    conn.close().await;

    match result {
        Ok(()) => {
            ctx.formatter.success(&format!("Sent to {receiver}"));
            Ok(ExitCode::Success)
        }
        Err(e) => {
            ctx.formatter.error(&format!("send failed: {e}"));
            Ok(connection_exit_code(&e))
        }
    }
}

async fn listen(ctx: &CommandContext, identity: &Identity) -> anyhow::Result<ExitCode> {
    let session = bail_code!(ctx.login(identity));
    let mut conn = bail_code!(ctx.connect().await);
    ctx.formatter
        .success(&format!("Listening as {}. Press Ctrl+C to stop.", conn.identity()));

    loop {
        tokio::select! {
            frame = conn.next_frame() => match frame {
                Some(ServerFrame::Deliver { delivery }) => {
                    let view = session.open_delivery(&delivery);
                    println!("{}", ctx.formatter.format_message(&view));
                }
                Some(other) => debug!(?other, "ignoring frame"),
                None => {
                    ctx.formatter.error("relay closed the connection");
                    return Ok(ExitCode::ConnectionFailed);
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    conn.close().await;
    Ok(ExitCode::Success)
}

async fn history(ctx: &CommandContext, identity: &Identity, peer: &str) -> anyhow::Result<ExitCode> {
    let session = bail_code!(ctx.login(identity));
    let peer = match Identity::parse(peer) {
        Ok(peer) => peer,
        Err(e) => {
            ctx.formatter.error(&format!("invalid peer: {e}"));
            return Ok(ExitCode::InvalidInput);
        }
    };

    let mut conn = bail_code!(ctx.connect().await);
    let result = conn.request_history(&peer).await;
    conn.close().await;

    match result {
        Ok(records) => {
            let views = session.open_history(&peer, &records);
            let rendered = ctx.formatter.format_messages(&views);
            if !rendered.is_empty() {
                println!("{rendered}");
            }
            Ok(ExitCode::Success)
        }
        Err(e) => {
            ctx.formatter.error(&format!("history failed: {e}"));
            Ok(connection_exit_code(&e))
        }
    }
}
