//! QUIC connection to the relay
//!
//! One bidirectional stream carries every frame. A background task reads
//! server frames into a channel; replies to requests are matched in order
//! while live deliveries that arrive in between are held for the caller.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Endpoint, VarInt};
use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pqchat_crypto::{EnvelopeRecord, Identity, PublicKey};
use pqchat_relay::protocol::{
    max_plaintext_len, ClientFrame, FrameCodec, FramingError, ServerFrame, ALPN, REJECTED_CLOSE_CODE,
};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("tls/cert error: {0}")]
    Tls(String),
    #[error("quic error: {0}")]
    Quic(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error("relay rejected the session: {0}")]
    Rejected(String),
    #[error("relay error: {0}")]
    Relay(String),
    #[error("unexpected frame from relay: {0}")]
    Unexpected(String),
    #[error("message too large ({len} bytes, max {max})")]
    MessageTooLarge { len: usize, max: usize },
    #[error("timed out waiting for the relay")]
    Timeout,
    #[error("connection closed")]
    Closed,
    #[error("configuration: {0}")]
    Config(String),
}

/// Trust only the CA certificates in `path`.
pub fn make_client_config(ca_cert_path: &Path) -> Result<ClientConfig, ConnectionError> {
    let pem = std::fs::read(ca_cert_path)?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert: CertificateDer<'static> = cert?;
        roots.add(cert).map_err(|e| ConnectionError::Tls(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(ConnectionError::Tls(format!(
            "no certificates found in {}",
            ca_cert_path.display()
        )));
    }

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(tls).map_err(|e| ConnectionError::Tls(e.to_string()))?,
    )))
}

/// Reason text of a close the relay issued to reject the handshake.
fn rejection_reason(close: &quinn::ConnectionError) -> Option<String> {
    match close {
        quinn::ConnectionError::ApplicationClosed(close)
            if close.error_code == VarInt::from_u32(REJECTED_CLOSE_CODE) =>
        {
            Some(String::from_utf8_lossy(&close.reason).into_owned())
        }
        _ => None,
    }
}

/// Server frames received so far, with deliveries held back while a
/// request is waiting for its reply.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<ServerFrame>,
    held: VecDeque<ServerFrame>,
    timeout: Duration,
}

impl Inbox {
    pub fn new(rx: mpsc::UnboundedReceiver<ServerFrame>, timeout: Duration) -> Self {
        Self {
            rx,
            held: VecDeque::new(),
            timeout,
        }
    }

    /// Next frame in arrival order. `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<ServerFrame> {
        match self.held.pop_front() {
            Some(frame) => Some(frame),
            None => self.rx.recv().await,
        }
    }

    /// Wait for the next non-delivery frame.
    pub async fn reply(&mut self) -> Result<ServerFrame, ConnectionError> {
        loop {
            let frame = tokio::time::timeout(self.timeout, self.rx.recv())
                .await
                .map_err(|_| ConnectionError::Timeout)?
                .ok_or(ConnectionError::Closed)?;
            match frame {
                ServerFrame::Deliver { .. } => self.held.push_back(frame),
                ServerFrame::Error { message } => return Err(ConnectionError::Relay(message)),
                other => return Ok(other),
            }
        }
    }

    /// Collect every page of a history reply, oldest first.
    pub async fn history(&mut self) -> Result<Vec<EnvelopeRecord>, ConnectionError> {
        let mut envelopes = Vec::new();
        loop {
            match self.reply().await? {
                ServerFrame::History { envelopes: page, more, .. } => {
                    envelopes.extend(page);
                    if !more {
                        return Ok(envelopes);
                    }
                }
                other => return Err(ConnectionError::Unexpected(format!("{other:?}"))),
            }
        }
    }
}

pub struct RelayConnection {
    identity: Identity,
    endpoint: Endpoint,
    connection: quinn::Connection,
    send: quinn::SendStream,
    codec: FrameCodec,
    inbox: Inbox,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Connect, authenticate with `token` and wait for the relay's welcome.
    pub async fn connect(config: &Config, token: &str) -> Result<Self, ConnectionError> {
        let ca_cert_path = config
            .relay
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| ConnectionError::Config("relay.ca_cert_path is not set".to_string()))?;
        let client_config = make_client_config(ca_cert_path)?;

        let remote = tokio::net::lookup_host(&config.relay.address)
            .await?
            .next()
            .ok_or_else(|| ConnectionError::Config(format!("cannot resolve {}", config.relay.address)))?;
        let bind_addr: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };

        let mut endpoint = Endpoint::client(bind_addr).map_err(|e| ConnectionError::Quic(e.to_string()))?;
        endpoint.set_default_client_config(client_config);

        let timeout = Duration::from_secs(config.relay.timeout_seconds);
        let connecting = endpoint
            .connect(remote, &config.relay.server_name)
            .map_err(|e| ConnectionError::Quic(e.to_string()))?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ConnectionError::Timeout)?
            .map_err(|e| ConnectionError::Quic(e.to_string()))?;
        debug!(%remote, "QUIC connection established");

        let (mut send, mut recv) = connection
            .open_bi()
            .await
            .map_err(|e| ConnectionError::Quic(e.to_string()))?;

        let codec = FrameCodec::new(config.relay.max_frame_size);
        codec
            .write_frame(
                &mut send,
                &ClientFrame::Hello {
                    token: Some(token.to_string()),
                },
            )
            .await?;

        // A rejected handshake may close before the reason frame is read;
        // the close itself then carries the reason.
        let rejected = |fallback: ConnectionError| {
            match connection.close_reason().as_ref().and_then(rejection_reason) {
                Some(reason) => ConnectionError::Rejected(reason),
                None => fallback,
            }
        };
        let first = match tokio::time::timeout(timeout, codec.read_frame::<_, ServerFrame>(&mut recv))
            .await
            .map_err(|_| ConnectionError::Timeout)?
        {
            Ok(first) => first,
            Err(e) => return Err(rejected(e.into())),
        };
        let identity = match first {
            Some(ServerFrame::Welcome { identity }) => identity,
            Some(ServerFrame::Rejected { reason }) => return Err(ConnectionError::Rejected(reason)),
            Some(other) => return Err(ConnectionError::Unexpected(format!("{other:?}"))),
            None => return Err(rejected(ConnectionError::Closed)),
        };
        info!(%identity, %remote, "connected to relay");

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            loop {
                match codec.read_frame::<_, ServerFrame>(&mut recv).await {
                    Ok(Some(frame)) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("relay stream error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            identity,
            endpoint,
            connection,
            send,
            codec,
            inbox: Inbox::new(rx, timeout),
            reader,
        })
    }

    /// The identity the relay authenticated.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn send_message(&mut self, receiver: &Identity, plaintext: &str) -> Result<(), ConnectionError> {
        let max = max_plaintext_len(self.codec.max_frame_size());
        if plaintext.len() > max {
            return Err(ConnectionError::MessageTooLarge {
                len: plaintext.len(),
                max,
            });
        }
        let frame = ClientFrame::Send {
            receiver: receiver.clone(),
            plaintext: plaintext.to_string(),
        };
        self.codec.write_frame(&mut self.send, &frame).await?;
        Ok(())
    }

    /// Publish our public key and wait for the acknowledgement.
    pub async fn register_key(&mut self, public_key: &PublicKey) -> Result<(), ConnectionError> {
        let frame = ClientFrame::RegisterKey {
            public_key: public_key.clone(),
        };
        self.codec.write_frame(&mut self.send, &frame).await?;
        match self.inbox.reply().await? {
            ServerFrame::KeyRegistered => Ok(()),
            other => Err(ConnectionError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn request_history(&mut self, peer: &Identity) -> Result<Vec<EnvelopeRecord>, ConnectionError> {
        let frame = ClientFrame::History { peer: peer.clone() };
        self.codec.write_frame(&mut self.send, &frame).await?;
        self.inbox.history().await
    }

    /// Next frame pushed by the relay, typically a delivery.
    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        self.inbox.next().await
    }

    /// Finish our stream and wait for the relay to finish its side, so every
    /// frame written so far has been handled before the connection closes.
    pub async fn close(mut self) {
        let _ = self.send.finish();
        let drain = async { while self.inbox.next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(2), drain).await.is_err() {
            debug!("relay did not finish its stream before close timeout");
        }
        self.reader.abort();
        self.connection.close(0u32.into(), b"bye");
        if tokio::time::timeout(Duration::from_secs(2), self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("endpoint did not go idle before close timeout");
        }
    }
}
