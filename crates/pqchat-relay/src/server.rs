//! QUIC relay server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Response,
    routing::{get, Router},
};
use quinn::{Connection as QuinnConnection, Endpoint, SendStream, ServerConfig as QuinnServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::admin::AdminApi;
use crate::auth::{unix_now, TokenAuthenticator};
use crate::config::ServerConfig;
use crate::directory::{InMemoryKeyDirectory, KeyDirectory};
use crate::metrics::RelayMetrics;
use crate::protocol::{ClientFrame, FrameCodec, FramingError, ServerFrame, ALPN, REJECTED_CLOSE_CODE};
use crate::router::{ConnectionContext, RelayRouter};
use crate::sqlite_store::SqliteStore;
use crate::store::{InMemoryMessageStore, MessageStore};

/// How long a rejected client gets to read the reason before the close.
const REJECT_LINGER: Duration = Duration::from_secs(2);

/// Assemble the router and its backing stores from configuration.
pub fn build_router(config: &ServerConfig) -> Result<(RelayRouter, Arc<TokenAuthenticator>)> {
    let cipher = config.build_cipher().context("Invalid cipher suite")?;

    let issuer_hex = config
        .issuer_public_key
        .as_deref()
        .context("issuer_public_key is not configured")?;
    let authenticator = Arc::new(TokenAuthenticator::from_hex(issuer_hex).context("Invalid issuer key")?);

    let (directory, store): (Arc<dyn KeyDirectory>, Arc<dyn MessageStore>) = match &config.database_path {
        Some(path) => {
            let sqlite = SqliteStore::new(path)
                .with_context(|| format!("Failed to open database: {:?}", path))?;
            info!("Using SQLite storage at {:?}", path);
            (Arc::new(sqlite.clone()), Arc::new(sqlite))
        }
        None => {
            warn!("No database configured, envelopes and keys are kept in memory");
            (Arc::new(InMemoryKeyDirectory::new()), Arc::new(InMemoryMessageStore::new()))
        }
    };

    let metrics = Arc::new(RelayMetrics::new()?);
    let router = RelayRouter::new(cipher, authenticator.clone(), directory, store, metrics)
        .with_max_frame_size(config.max_frame_size);
    Ok((router, authenticator))
}

/// QUIC relay server
pub struct RelayServer {
    config: ServerConfig,
    router: Arc<RelayRouter>,
    authenticator: Arc<TokenAuthenticator>,
    endpoint: Endpoint,
}

impl RelayServer {
    /// Create new relay server
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let (router, authenticator) = build_router(&config)?;

        let cert_chain = load_cert_chain(&config.quic_cert_path)?;
        let key = load_private_key(&config.quic_key_path)?;

        let mut tls = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .context("Failed to create TLS config")?;
        tls.alpn_protocols = vec![ALPN.to_vec()];

        let mut transport = TransportConfig::default();
        transport.max_idle_timeout(Some(
            Duration::from_secs(config.idle_timeout_secs)
                .try_into()
                .context("Invalid idle timeout")?,
        ));
        transport.keep_alive_interval(Some(Duration::from_secs(config.keepalive_interval_secs)));

        let mut server_cfg = QuinnServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls)
                .context("Failed to create QUIC server config")?,
        ));
        server_cfg.transport_config(Arc::new(transport));

        let endpoint = Endpoint::server(server_cfg, config.listen_addr)
            .context("Failed to create QUIC endpoint")?;

        Ok(Self {
            config,
            router: Arc::new(router),
            authenticator,
            endpoint,
        })
    }

    pub fn router(&self) -> &Arc<RelayRouter> {
        &self.router
    }

    /// Address the QUIC endpoint is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the relay server until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting relay server on {} ({} + {})",
            self.config.listen_addr,
            self.router.cipher().kem().algorithm(),
            self.router.cipher().aead().algorithm()
        );

        if let Some(http_addr) = self.config.http_addr {
            let mut http_router = Router::new()
                .route("/health", get(health_handler))
                .route("/ready", get(ready_handler))
                .route("/metrics", get(metrics_handler))
                .with_state(self.router.metrics().clone())
                .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

            if let Some(admin_token) = &self.config.admin_token {
                let admin_api = AdminApi::new(
                    self.router.presence().clone(),
                    self.router.metrics().clone(),
                    admin_token.clone(),
                );
                http_router = http_router.merge(admin_api.router());
                info!("Admin API enabled on {}", http_addr);
            }

            let listener = tokio::net::TcpListener::bind(&http_addr).await?;
            info!("HTTP server for health/metrics listening on {}", http_addr);
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, http_router).await {
                    error!("HTTP server error: {}", e);
                }
            });
        }

        // Token cache cleanup
        let authenticator = self.authenticator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                authenticator.cleanup_expired(unix_now());
            }
        });

        let codec = FrameCodec::new(self.config.max_frame_size);
        let accept_loop = async {
            while let Some(incoming) = self.endpoint.accept().await {
                let router = self.router.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            let remote = conn.remote_address();
                            if let Err(e) = handle_connection(conn, router, codec).await {
                                warn!("Connection from {} ended with error: {}", remote, e);
                            }
                        }
                        Err(e) => warn!("Connection failed: {}", e),
                    }
                });
            }
        };

        tokio::select! {
            _ = accept_loop => {
                warn!("QUIC endpoint stopped accepting connections");
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for shutdown signal")?;
                info!("Shutdown signal received");
            }
        }

        self.endpoint.close(0u32.into(), b"shutdown");
        if tokio::time::timeout(Duration::from_secs(10), self.endpoint.wait_idle())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with connections still open");
        }

        info!("Shutting down relay server");
        Ok(())
    }
}

/// Load certificate chain from file
fn load_cert_chain(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = std::fs::read(path)
        .with_context(|| format!("Failed to read certificate file: {:?}", path))?;
    let certs = certs(&mut cert_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;
    Ok(certs)
}

/// Load private key from file
fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let key_file = std::fs::read(path)
        .with_context(|| format!("Failed to read key file: {:?}", path))?;
    let mut keys = pkcs8_private_keys(&mut key_file.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse private key")?;

    if keys.is_empty() {
        anyhow::bail!("No private keys found in file");
    }

    Ok(PrivateKeyDer::from(PrivatePkcs8KeyDer::from(keys.remove(0))))
}

/// Serve one client: hello handshake, then frames until the stream ends.
///
/// Frames from one connection are handled strictly in arrival order.
async fn handle_connection(conn: QuinnConnection, router: Arc<RelayRouter>, codec: FrameCodec) -> Result<()> {
    let remote = conn.remote_address();
    debug!("New connection from {}", remote);

    let (mut send, mut recv) = conn.accept_bi().await.context("No control stream opened")?;

    let token = match codec.read_frame::<_, ClientFrame>(&mut recv).await? {
        Some(ClientFrame::Hello { token }) => token,
        Some(_) => return reject(&conn, &mut send, codec, "expected hello".to_string()).await,
        None => return Ok(()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let reply_tx = tx.clone();
    let ctx = match router.connect(token.as_deref(), tx).await {
        Ok(ctx) => ctx,
        Err(e) => return reject(&conn, &mut send, codec, e.to_string()).await,
    };

    codec
        .write_frame(
            &mut send,
            &ServerFrame::Welcome {
                identity: ctx.identity().clone(),
            },
        )
        .await?;

    let writer = spawn_writer(router.clone(), ctx.clone(), rx, send, codec);

    'frames: loop {
        match codec.read_frame::<_, ClientFrame>(&mut recv).await {
            Ok(Some(frame)) => {
                for reply in router.handle_frame(&ctx, frame).await {
                    if reply_tx.send(reply).is_err() {
                        break 'frames;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(identity = %ctx.identity(), "Dropping connection: {}", e);
                break;
            }
        }
    }

    router.disconnect(&ctx);
    drop(reply_tx);
    let _ = writer.await;
    debug!("Connection closed: {}", remote);
    Ok(())
}

/// Tell the client why it was turned away, then close with
/// [`REJECTED_CLOSE_CODE`] once the frame is acknowledged or the wait runs out.
async fn reject(conn: &QuinnConnection, send: &mut SendStream, codec: FrameCodec, reason: String) -> Result<()> {
    debug!(remote = %conn.remote_address(), %reason, "Rejecting connection");
    codec
        .write_frame(send, &ServerFrame::Rejected { reason: reason.clone() })
        .await?;
    send.finish().context("Failed to finish control stream")?;
    if tokio::time::timeout(REJECT_LINGER, send.stopped()).await.is_err() {
        debug!("Rejected client did not acknowledge in time");
    }
    conn.close(VarInt::from_u32(REJECTED_CLOSE_CODE), reason.as_bytes());
    Ok(())
}

/// Drain queued frames onto the send half of a client stream.
///
/// A frame too large to encode is replaced by an `error` frame and writing
/// carries on. The writer stops when the stream fails or the queue closes,
/// and the connection leaves presence either way.
fn spawn_writer<W>(
    router: Arc<RelayRouter>,
    ctx: ConnectionContext,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    mut send: W,
    codec: FrameCodec,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match codec.write_frame(&mut send, &frame).await {
                Ok(()) => {}
                Err(FramingError::TooLarge(len, max)) => {
                    warn!(identity = %ctx.identity(), len, max, "Outbound frame too large, replying with error");
                    let notice = ServerFrame::Error {
                        message: format!("response too large ({} bytes, max {})", len, max),
                    };
                    if let Err(e) = codec.write_frame(&mut send, &notice).await {
                        debug!("Writer stopped: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Writer stopped: {}", e);
                    break;
                }
            }
        }
        router.disconnect(&ctx);
        let _ = send.shutdown().await;
    })
}

/// Health check handler
async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check: the metrics registry answers, so the process is serving.
async fn ready_handler(State(metrics): State<Arc<RelayMetrics>>) -> StatusCode {
    match metrics.export() {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Metrics export handler
async fn metrics_handler(State(metrics): State<Arc<RelayMetrics>>) -> Result<Response<String>, StatusCode> {
    match metrics.export() {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenIssuer;

    fn config() -> ServerConfig {
        config_for(&TokenIssuer::generate())
    }

    fn config_for(issuer: &TokenIssuer) -> ServerConfig {
        ServerConfig {
            issuer_public_key: Some(hex::encode(issuer.verifying_key().to_bytes())),
            ..ServerConfig::default()
        }
    }

    async fn connected(
        max_frame_size: usize,
    ) -> (Arc<RelayRouter>, ConnectionContext, mpsc::UnboundedSender<ServerFrame>, mpsc::UnboundedReceiver<ServerFrame>) {
        let issuer = TokenIssuer::generate();
        let config = ServerConfig {
            max_frame_size,
            ..config_for(&issuer)
        };
        let (router, _auth) = build_router(&config).unwrap();
        let router = Arc::new(router);
        let alice = pqchat_crypto::Identity::parse("alice").unwrap();
        let token = issuer.issue(&alice, unix_now(), 600).encode();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = router.connect(Some(&token), tx.clone()).await.unwrap();
        (router, ctx, tx, rx)
    }

    #[test]
    fn test_build_router_in_memory() {
        let (router, _auth) = build_router(&config()).unwrap();
        assert_eq!(router.cipher().kem().algorithm(), "kyber768");
        assert_eq!(router.presence().online_count(), 0);
    }

    #[test]
    fn test_build_router_with_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            database_path: Some(dir.path().join("relay.db")),
            ..config()
        };
        build_router(&config).unwrap();
        assert!(dir.path().join("relay.db").exists());
    }

    #[test]
    fn test_build_router_rejects_bad_issuer_key() {
        let config = ServerConfig {
            issuer_public_key: Some("zz".to_string()),
            ..ServerConfig::default()
        };
        assert!(build_router(&config).is_err());
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        metrics.record_send();
        let response = metrics_handler(State(metrics.clone())).await.unwrap();
        assert!(response.body().contains("pqchat_relay_sends_total 1"));
        assert_eq!(ready_handler(State(metrics)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_writer_replaces_oversized_frame_with_error() {
        let (router, ctx, tx, rx) = connected(crate::protocol::MIN_FRAME_SIZE).await;
        let codec = FrameCodec::new(crate::protocol::MIN_FRAME_SIZE);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let writer = spawn_writer(router.clone(), ctx.clone(), rx, server, codec);

        tx.send(ServerFrame::Error {
            message: "x".repeat(crate::protocol::MIN_FRAME_SIZE),
        })
        .unwrap();
        tx.send(ServerFrame::KeyRegistered).unwrap();

        match codec.read_frame::<_, ServerFrame>(&mut client).await.unwrap() {
            Some(ServerFrame::Error { message }) => assert!(message.starts_with("response too large")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(
            codec.read_frame::<_, ServerFrame>(&mut client).await.unwrap(),
            Some(ServerFrame::KeyRegistered)
        );
        assert_eq!(router.presence().online_count(), 1);

        router.disconnect(&ctx);
        drop(tx);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_writer_leaves_presence() {
        let (router, ctx, tx, rx) = connected(crate::protocol::MAX_FRAME_SIZE).await;
        let (client, server) = tokio::io::duplex(1024);
        drop(client);
        let writer = spawn_writer(router.clone(), ctx.clone(), rx, server, FrameCodec::default());

        tx.send(ServerFrame::KeyRegistered).unwrap();
        writer.await.unwrap();

        assert_eq!(router.presence().online_count(), 0);
        assert!(router.presence().lookup(ctx.identity()).is_none());
        assert!(tx.send(ServerFrame::KeyRegistered).is_err());
    }
}
