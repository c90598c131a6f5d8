//! Relay router.
//!
//! Binds every connection to the identity proven in its handshake, builds
//! the dual-copy envelope for each send, persists it and forwards the
//! receiver copy to a live endpoint when there is one.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pqchat_crypto::{build_envelope, CryptoError, EnvelopeRecord, HybridCipher, Identity, PublicKey};

use crate::auth::{AuthError, Authenticator};
use crate::directory::{DirectoryError, KeyDirectory};
use crate::metrics::RelayMetrics;
use crate::presence::{ConnectionId, Endpoint, PresenceDirectory};
use crate::protocol::{history_frames, max_plaintext_len, ClientFrame, ServerFrame, MAX_FRAME_SIZE};
use crate::store::{MessageStore, StoreError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("no published key for {0}")]
    UnknownIdentity(Identity),
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("message store failed: {0}")]
    Store(#[from] StoreError),
    #[error("message too large ({len} bytes, max {max})")]
    MessageTooLarge { len: usize, max: usize },
}

/// Identity and connection a handler acts on behalf of.
///
/// Only [`RelayRouter::connect`] creates one, after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    identity: Identity,
    connection_id: ConnectionId,
}

impl ConnectionContext {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }
}

/// Outcome of one accepted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub envelope_id: Uuid,
    pub persisted: bool,
    pub delivered: bool,
}

pub struct RelayRouter {
    cipher: HybridCipher,
    authenticator: Arc<dyn Authenticator>,
    directory: Arc<dyn KeyDirectory>,
    store: Arc<dyn MessageStore>,
    presence: Arc<PresenceDirectory>,
    metrics: Arc<RelayMetrics>,
    max_frame_size: usize,
}

impl RelayRouter {
    pub fn new(
        cipher: HybridCipher,
        authenticator: Arc<dyn Authenticator>,
        directory: Arc<dyn KeyDirectory>,
        store: Arc<dyn MessageStore>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            cipher,
            authenticator,
            directory,
            store,
            presence: Arc::new(PresenceDirectory::new()),
            metrics,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Frame limit that history replies are paged against. Message
    /// plaintext is capped at a quarter of it.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn presence(&self) -> &Arc<PresenceDirectory> {
        &self.presence
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn cipher(&self) -> &HybridCipher {
        &self.cipher
    }

    /// Authenticate a new connection and mark its identity online.
    pub async fn connect(
        &self,
        credentials: Option<&str>,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<ConnectionContext, RelayError> {
        let identity = match self.authenticator.authenticate(credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                self.metrics.record_auth_failure();
                warn!(error = %e, "rejecting connection");
                return Err(e.into());
            }
        };

        let connection_id = self.presence.next_connection_id();
        if let Some(previous) = self
            .presence
            .connect(identity.clone(), Endpoint::new(connection_id, tx))
        {
            info!(
                %identity,
                previous = previous.connection_id(),
                current = connection_id,
                "identity reconnected, replacing endpoint"
            );
        }

        self.metrics.record_connection();
        self.metrics.set_online(self.presence.online_count());
        info!(%identity, connection_id, "connection authenticated");

        Ok(ConnectionContext {
            identity,
            connection_id,
        })
    }

    /// Remove live-delivery eligibility for this connection. Idempotent.
    pub fn disconnect(&self, ctx: &ConnectionContext) -> bool {
        let removed = self.presence.disconnect(&ctx.identity, ctx.connection_id);
        self.metrics.set_online(self.presence.online_count());
        if removed {
            info!(identity = %ctx.identity, connection_id = ctx.connection_id, "identity offline");
        }
        removed
    }

    async fn require_key(&self, identity: &Identity) -> Result<PublicKey, RelayError> {
        match self.directory.lookup(identity).await? {
            Some(key) => Ok(key),
            None => Err(RelayError::UnknownIdentity(identity.clone())),
        }
    }

    /// Seal, persist and forward one message from the connection's identity.
    ///
    /// Persistence failures are logged and reported in the returned
    /// [`SendReport`]; they never prevent live delivery.
    pub async fn handle_send(
        &self,
        ctx: &ConnectionContext,
        receiver: &Identity,
        plaintext: &[u8],
    ) -> Result<SendReport, RelayError> {
        self.metrics.record_send();
        let sender = &ctx.identity;

        let max = max_plaintext_len(self.max_frame_size);
        if plaintext.len() > max {
            warn!(%sender, %receiver, len = plaintext.len(), max, "dropping oversized send");
            return Err(RelayError::MessageTooLarge {
                len: plaintext.len(),
                max,
            });
        }

        let (their_key, own_key) =
            tokio::join!(self.require_key(receiver), self.require_key(sender));
        let (their_key, own_key) = match (their_key, own_key) {
            (Ok(their), Ok(own)) => (their, own),
            (Err(e), _) | (_, Err(e)) => {
                if matches!(e, RelayError::UnknownIdentity(_)) {
                    self.metrics.record_unknown_identity();
                }
                warn!(%sender, %receiver, error = %e, "dropping send");
                return Err(e);
            }
        };

        let envelope = build_envelope(&self.cipher, sender, receiver, plaintext, &own_key, &their_key)
            .map_err(|e| {
                if matches!(e, CryptoError::KeyFormat { .. }) {
                    self.metrics.record_key_format_error();
                }
                error!(%sender, %receiver, error = %e, "failed to build envelope");
                e
            })?;

        let persist = async {
            match self.store.append(&envelope).await {
                Ok(()) => {
                    self.metrics.record_persisted();
                    true
                }
                Err(e) => {
                    self.metrics.record_persistence_failure();
                    error!(envelope = %envelope.id(), error = %e, "failed to persist envelope");
                    false
                }
            }
        };

        let forward = async {
            let Some(endpoint) = self.presence.lookup(receiver) else {
                self.metrics.set_online(self.presence.online_count());
                debug!(%receiver, "receiver offline, no live delivery");
                return false;
            };
            let delivered = endpoint.push(ServerFrame::Deliver {
                delivery: envelope.delivery(),
            });
            if delivered {
                self.metrics.record_delivery();
            } else {
                debug!(%receiver, "receiver endpoint closed before delivery");
            }
            delivered
        };

        let (persisted, delivered) = tokio::join!(persist, forward);
        debug!(envelope = %envelope.id(), %sender, %receiver, persisted, delivered, "send handled");

        Ok(SendReport {
            envelope_id: envelope.id(),
            persisted,
            delivered,
        })
    }

    /// Publish the connection identity's own public key.
    pub async fn register_key(
        &self,
        ctx: &ConnectionContext,
        public_key: PublicKey,
    ) -> Result<(), RelayError> {
        let expected = self.cipher.kem().public_key_len();
        if public_key.len() != expected {
            return Err(CryptoError::KeyFormat {
                what: "public key",
                expected,
                got: public_key.len(),
            }
            .into());
        }

        self.directory.register(&ctx.identity, public_key).await?;
        self.metrics.record_key_registered();
        info!(identity = %ctx.identity, "public key registered");
        Ok(())
    }

    /// Conversation between the connection identity and `peer`, oldest first.
    pub async fn history(
        &self,
        ctx: &ConnectionContext,
        peer: &Identity,
    ) -> Result<Vec<EnvelopeRecord>, RelayError> {
        let envelopes = self.store.query_range(&ctx.identity, peer).await?;
        self.metrics.record_history_query();
        Ok(envelopes.iter().map(|e| e.to_record()).collect())
    }

    /// Dispatch one client frame received after the handshake.
    ///
    /// Returns the frames to send back, in order. Sends never produce a
    /// reply; history may span several pages.
    pub async fn handle_frame(&self, ctx: &ConnectionContext, frame: ClientFrame) -> Vec<ServerFrame> {
        match frame {
            ClientFrame::Send { receiver, plaintext } => {
                // Failures were logged inside handle_send and are not surfaced.
                let _ = self.handle_send(ctx, &receiver, plaintext.as_bytes()).await;
                Vec::new()
            }
            ClientFrame::RegisterKey { public_key } => match self.register_key(ctx, public_key).await {
                Ok(()) => vec![ServerFrame::KeyRegistered],
                Err(e) => vec![ServerFrame::Error {
                    message: e.to_string(),
                }],
            },
            ClientFrame::History { peer } => match self.history(ctx, &peer).await {
                Ok(envelopes) => history_frames(&peer, envelopes, self.max_frame_size),
                Err(e) => {
                    warn!(identity = %ctx.identity, %peer, error = %e, "history query failed");
                    vec![ServerFrame::Error {
                        message: "history unavailable".to_string(),
                    }]
                }
            },
            ClientFrame::Hello { .. } => vec![ServerFrame::Error {
                message: "already authenticated".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pqchat_crypto::{Envelope, KeyPair};

    use crate::auth::{unix_now, TokenAuthenticator, TokenIssuer};
    use crate::directory::InMemoryKeyDirectory;
    use crate::store::InMemoryMessageStore;

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn append(&self, _: &Envelope) -> Result<(), StoreError> {
            Err(StoreError::OperationFailed("disk full".into()))
        }

        async fn query_range(&self, _: &Identity, _: &Identity) -> Result<Vec<Envelope>, StoreError> {
            Err(StoreError::OperationFailed("disk full".into()))
        }
    }

    struct Harness {
        router: RelayRouter,
        issuer: TokenIssuer,
        directory: Arc<InMemoryKeyDirectory>,
    }

    fn harness(store: Arc<dyn MessageStore>) -> Harness {
        let issuer = TokenIssuer::generate();
        let directory = Arc::new(InMemoryKeyDirectory::new());
        let router = RelayRouter::new(
            HybridCipher::default_suite(),
            Arc::new(TokenAuthenticator::new(issuer.verifying_key())),
            directory.clone(),
            store,
            Arc::new(RelayMetrics::new().unwrap()),
        );
        Harness {
            router,
            issuer,
            directory,
        }
    }

    impl Harness {
        async fn join(&self, name: &str) -> (ConnectionContext, KeyPair, mpsc::UnboundedReceiver<ServerFrame>) {
            let identity = Identity::parse(name).unwrap();
            let token = self.issuer.issue(&identity, unix_now(), 600).encode();
            let (tx, rx) = mpsc::unbounded_channel();
            let ctx = self.router.connect(Some(&token), tx).await.unwrap();
            let keys = self.router.cipher().kem().generate_keypair().unwrap();
            self.router.register_key(&ctx, keys.public_key.clone()).await.unwrap();
            (ctx, keys, rx)
        }
    }

    #[tokio::test]
    async fn test_connect_requires_credentials() {
        let h = harness(Arc::new(InMemoryMessageStore::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = h.router.connect(None, tx).await.unwrap_err();
        assert!(matches!(err, RelayError::Authentication(AuthError::MissingCredentials)));
        assert_eq!(h.router.presence().online_count(), 0);
    }

    #[tokio::test]
    async fn test_spoofed_sender_in_payload_is_ignored() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store.clone());
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (_mallory, _km, _rxm) = h.join("mallory").await;
        let (_bob, kb, mut rxb) = h.join("bob").await;

        let raw = r#"{"type":"send","receiver":"bob","plaintext":"hi","sender":"mallory"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(h.router.handle_frame(&alice, frame).await.is_empty());

        let bob_id = Identity::parse("bob").unwrap();
        let stored = store.query_range(alice.identity(), &bob_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sender().as_str(), "alice");

        match rxb.try_recv().unwrap() {
            ServerFrame::Deliver { delivery } => {
                assert_eq!(delivery.sender.as_str(), "alice");
                let text = delivery.open(h.router.cipher(), &kb.secret_key).unwrap();
                assert_eq!(text.as_slice(), b"hi");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_still_delivers() {
        let h = harness(Arc::new(FailingStore));
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (bob, _kb, mut rxb) = h.join("bob").await;

        let report = h.router.handle_send(&alice, bob.identity(), b"hi").await.unwrap();
        assert!(!report.persisted);
        assert!(report.delivered);
        assert!(matches!(rxb.try_recv(), Ok(ServerFrame::Deliver { .. })));
        assert_eq!(h.router.metrics().persistence_failures(), 1.0);
    }

    #[tokio::test]
    async fn test_unknown_receiver_is_dropped() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store.clone());
        let (alice, _ka, _rxa) = h.join("alice").await;
        let carol = Identity::parse("carol").unwrap();

        let err = h.router.handle_send(&alice, &carol, b"hi").await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownIdentity(ref id) if id == &carol));
        assert!(store.is_empty().await);
        assert_eq!(h.router.metrics().unknown_identity_drops(), 1.0);
    }

    #[tokio::test]
    async fn test_sender_without_published_key_is_dropped() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store.clone());
        let (_bob, _kb, mut rxb) = h.join("bob").await;

        let dave = Identity::parse("dave").unwrap();
        let token = h.issuer.issue(&dave, unix_now(), 600).encode();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = h.router.connect(Some(&token), tx).await.unwrap();

        let bob = Identity::parse("bob").unwrap();
        let err = h.router.handle_send(&ctx, &bob, b"hi").await.unwrap_err();
        assert!(matches!(err, RelayError::UnknownIdentity(ref id) if id == &dave));
        assert!(store.is_empty().await);
        assert!(rxb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_published_key_aborts_send() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store.clone());
        let (alice, _ka, _rxa) = h.join("alice").await;
        let eve = Identity::parse("eve").unwrap();
        h.directory
            .register(&eve, PublicKey::from_bytes(vec![0u8; 12]))
            .await
            .unwrap();

        let err = h.router.handle_send(&alice, &eve, b"hi").await.unwrap_err();
        assert!(matches!(err, RelayError::Crypto(CryptoError::KeyFormat { .. })));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_key_validates_length() {
        let h = harness(Arc::new(InMemoryMessageStore::new()));
        let (alice, _ka, _rxa) = h.join("alice").await;
        let reply = h
            .router
            .handle_frame(
                &alice,
                ClientFrame::RegisterKey {
                    public_key: PublicKey::from_bytes(vec![1, 2, 3]),
                },
            )
            .await;
        assert!(matches!(reply.as_slice(), [ServerFrame::Error { .. }]));
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_new_endpoint() {
        let h = harness(Arc::new(InMemoryMessageStore::new()));
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (bob_old, _kb, mut rx_old) = h.join("bob").await;

        let bob = Identity::parse("bob").unwrap();
        let token = h.issuer.issue(&bob, unix_now(), 600).encode();
        let (tx, mut rx_new) = mpsc::unbounded_channel();
        let bob_new = h.router.connect(Some(&token), tx).await.unwrap();

        assert!(!h.router.disconnect(&bob_old));
        let report = h.router.handle_send(&alice, &bob, b"hi").await.unwrap();
        assert!(report.delivered);
        assert!(matches!(rx_new.try_recv(), Ok(ServerFrame::Deliver { .. })));
        assert!(rx_old.try_recv().is_err());

        assert!(h.router.disconnect(&bob_new));
        assert!(!h.router.disconnect(&bob_new));
        let report = h.router.handle_send(&alice, &bob, b"later").await.unwrap();
        assert!(!report.delivered);
        assert!(report.persisted);
    }

    #[tokio::test]
    async fn test_history_is_scoped_to_connection_identity() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store);
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (bob, _kb, _rxb) = h.join("bob").await;
        let (carol, _kc, _rxc) = h.join("carol").await;

        h.router.handle_send(&alice, bob.identity(), b"hi").await.unwrap();

        assert_eq!(h.router.history(&alice, bob.identity()).await.unwrap().len(), 1);
        assert_eq!(h.router.history(&bob, alice.identity()).await.unwrap().len(), 1);
        assert!(h.router.history(&carol, bob.identity()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_is_reported_to_caller() {
        let h = harness(Arc::new(FailingStore));
        let (alice, _ka, _rxa) = h.join("alice").await;
        let reply = h
            .router
            .handle_frame(&alice, ClientFrame::History { peer: Identity::parse("bob").unwrap() })
            .await;
        assert!(matches!(reply.as_slice(), [ServerFrame::Error { .. }]));
    }

    #[tokio::test]
    async fn test_oversized_send_is_refused_before_sealing() {
        let store = Arc::new(InMemoryMessageStore::new());
        let h = harness(store.clone());
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (bob, _kb, mut rxb) = h.join("bob").await;

        let max = max_plaintext_len(MAX_FRAME_SIZE);
        let text = vec![b'x'; max + 1];
        let err = h.router.handle_send(&alice, bob.identity(), &text).await.unwrap_err();
        assert!(matches!(err, RelayError::MessageTooLarge { len, max: m } if len == max + 1 && m == max));
        assert!(store.is_empty().await);
        assert!(rxb.try_recv().is_err());

        let text = vec![b'x'; max];
        assert!(h.router.handle_send(&alice, bob.identity(), &text).await.unwrap().persisted);
    }

    #[tokio::test]
    async fn test_long_history_is_paged() {
        let store = Arc::new(InMemoryMessageStore::new());
        let mut h = harness(store);
        h.router = h.router.with_max_frame_size(crate::protocol::MIN_FRAME_SIZE);
        let (alice, _ka, _rxa) = h.join("alice").await;
        let (bob, _kb, _rxb) = h.join("bob").await;

        for i in 0..40 {
            let text = format!("message {i}");
            h.router.handle_send(&alice, bob.identity(), text.as_bytes()).await.unwrap();
        }

        let frames = h
            .router
            .handle_frame(&alice, ClientFrame::History { peer: bob.identity().clone() })
            .await;
        assert!(frames.len() > 1);
        let codec = crate::protocol::FrameCodec::new(crate::protocol::MIN_FRAME_SIZE);
        let mut total = 0;
        for (i, frame) in frames.iter().enumerate() {
            assert!(codec.encode(frame).is_ok());
            match frame {
                ServerFrame::History { envelopes, more, .. } => {
                    assert_eq!(*more, i + 1 < frames.len());
                    total += envelopes.len();
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(total, 40);
    }
}
