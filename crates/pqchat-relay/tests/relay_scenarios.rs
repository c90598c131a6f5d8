//! End-to-end relay flows over the router with a SQLite backend.

use std::sync::Arc;

use tokio::sync::mpsc;

use pqchat_crypto::{Envelope, HybridCipher, Identity, KeyPair, SecretKey};
use pqchat_relay::auth::unix_now;
use pqchat_relay::metrics::RelayMetrics;
use pqchat_relay::{
    ClientFrame, ConnectionContext, FrameCodec, RelayRouter, ServerFrame, SqliteStore, TokenAuthenticator,
    TokenIssuer,
};

struct Relay {
    router: RelayRouter,
    issuer: TokenIssuer,
}

struct Client {
    ctx: ConnectionContext,
    keys: KeyPair,
    inbox: mpsc::UnboundedReceiver<ServerFrame>,
}

fn relay() -> Relay {
    let issuer = TokenIssuer::generate();
    let sqlite = SqliteStore::new_in_memory().unwrap();
    let router = RelayRouter::new(
        HybridCipher::default_suite(),
        Arc::new(TokenAuthenticator::new(issuer.verifying_key())),
        Arc::new(sqlite.clone()),
        Arc::new(sqlite),
        Arc::new(RelayMetrics::new().unwrap()),
    );
    Relay { router, issuer }
}

impl Relay {
    async fn connect(&self, name: &str, keys: KeyPair) -> Client {
        let identity = Identity::parse(name).unwrap();
        let token = self.issuer.issue(&identity, unix_now(), 3600).encode();
        let (tx, inbox) = mpsc::unbounded_channel();
        let ctx = self.router.connect(Some(&token), tx).await.unwrap();
        let reply = self
            .router
            .handle_frame(
                &ctx,
                ClientFrame::RegisterKey {
                    public_key: keys.public_key.clone(),
                },
            )
            .await;
        assert_eq!(reply, vec![ServerFrame::KeyRegistered]);
        Client { ctx, keys, inbox }
    }

    fn keypair(&self) -> KeyPair {
        self.router.cipher().kem().generate_keypair().unwrap()
    }

    async fn send(&self, from: &Client, to: &str, text: &str) {
        let frame = ClientFrame::Send {
            receiver: Identity::parse(to).unwrap(),
            plaintext: text.to_string(),
        };
        assert!(self.router.handle_frame(&from.ctx, frame).await.is_empty());
    }

    /// History pages as they would go on the wire, in order.
    async fn history_pages(&self, client: &Client, peer: &str) -> Vec<ServerFrame> {
        self.router
            .handle_frame(
                &client.ctx,
                ClientFrame::History {
                    peer: Identity::parse(peer).unwrap(),
                },
            )
            .await
    }

    async fn history(&self, client: &Client, peer: &str) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        for page in self.history_pages(client, peer).await {
            match page {
                ServerFrame::History { envelopes: records, .. } => {
                    envelopes.extend(records.iter().map(|record| Envelope::from_record(record).unwrap()))
                }
                other => panic!("unexpected reply {other:?}"),
            }
        }
        envelopes
    }
}

fn copy_keys(keys: &KeyPair) -> KeyPair {
    KeyPair {
        public_key: keys.public_key.clone(),
        secret_key: SecretKey::from_bytes(keys.secret_key.expose_secret().to_vec()),
    }
}

#[tokio::test]
async fn live_delivery_then_sender_reads_own_history() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;
    let mut bob = relay.connect("bob", relay.keypair()).await;

    relay.send(&alice, "bob", "hi").await;

    let delivery = match bob.inbox.try_recv().unwrap() {
        ServerFrame::Deliver { delivery } => delivery,
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(delivery.sender.as_str(), "alice");
    let text = delivery.open(relay.router.cipher(), &bob.keys.secret_key).unwrap();
    assert_eq!(text.as_slice(), b"hi");

    let history = relay.history(&alice, "bob").await;
    assert_eq!(history.len(), 1);
    let own = history[0]
        .open_for(relay.router.cipher(), alice.ctx.identity(), &alice.keys.secret_key)
        .unwrap();
    assert_eq!(own.as_slice(), b"hi");
}

#[tokio::test]
async fn offline_receiver_reads_from_history_after_connecting() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;

    let bob_keys = relay.keypair();
    let mut bob = relay.connect("bob", copy_keys(&bob_keys)).await;
    relay.router.disconnect(&bob.ctx);
    while bob.inbox.try_recv().is_ok() {}

    relay.send(&alice, "bob", "while you were out").await;
    assert!(bob.inbox.try_recv().is_err());

    let bob = relay.connect("bob", bob_keys).await;
    let history = relay.history(&bob, "alice").await;
    assert_eq!(history.len(), 1);
    let text = history[0]
        .open_for(relay.router.cipher(), bob.ctx.identity(), &bob.keys.secret_key)
        .unwrap();
    assert_eq!(text.as_slice(), b"while you were out");
}

#[tokio::test]
async fn send_to_unregistered_identity_is_dropped() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;

    relay.send(&alice, "carol", "anyone there?").await;

    assert!(relay.history(&alice, "carol").await.is_empty());
    assert_eq!(relay.router.metrics().persisted(), 0.0);
    assert_eq!(relay.router.metrics().deliveries(), 0.0);
}

#[tokio::test]
async fn history_preserves_per_sender_order() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;
    let bob = relay.connect("bob", relay.keypair()).await;

    for i in 0..10 {
        relay.send(&alice, "bob", &format!("message {i}")).await;
    }

    let history = relay.history(&bob, "alice").await;
    let texts: Vec<String> = history
        .iter()
        .map(|e| {
            let text = e
                .open_for(relay.router.cipher(), bob.ctx.identity(), &bob.keys.secret_key)
                .unwrap();
            String::from_utf8(text.to_vec()).unwrap()
        })
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("message {i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn third_party_cannot_open_either_copy() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;
    let bob = relay.connect("bob", relay.keypair()).await;
    let eve = relay.connect("eve", relay.keypair()).await;

    relay.send(&alice, "bob", "secret").await;

    let history = relay.history(&bob, "alice").await;
    let err = history[0]
        .open_for(relay.router.cipher(), eve.ctx.identity(), &eve.keys.secret_key)
        .unwrap_err();
    assert!(err.is_undecryptable());

    // Eve holding Bob's ciphertext still needs Bob's secret key.
    let err = history[0]
        .open_for(relay.router.cipher(), bob.ctx.identity(), &eve.keys.secret_key)
        .unwrap_err();
    assert!(err.is_undecryptable());
}

#[tokio::test]
async fn long_history_spans_frames_within_the_limit() {
    let relay = relay();
    let alice = relay.connect("alice", relay.keypair()).await;
    let bob = relay.connect("bob", relay.keypair()).await;

    for i in 0..120 {
        relay.send(&alice, "bob", &format!("message {i:03} {}", "x".repeat(200))).await;
    }

    let codec = FrameCodec::default();
    let pages = relay.history_pages(&bob, "alice").await;
    assert!(pages.len() > 1);
    for (i, page) in pages.iter().enumerate() {
        assert!(codec.encode(page).is_ok(), "page {i} exceeds the frame limit");
        match page {
            ServerFrame::History { more, .. } => assert_eq!(*more, i + 1 < pages.len()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    let history = relay.history(&bob, "alice").await;
    assert_eq!(history.len(), 120);
    let first = history[0]
        .open_for(relay.router.cipher(), bob.ctx.identity(), &bob.keys.secret_key)
        .unwrap();
    assert!(first.as_slice().starts_with(b"message 000"));
    let last = history[119]
        .open_for(relay.router.cipher(), bob.ctx.identity(), &bob.keys.secret_key)
        .unwrap();
    assert!(last.as_slice().starts_with(b"message 119"));
}
