//! Metrics collection and export

use std::time::{Duration, Instant};

use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

/// Relay counters, exported in the Prometheus text format.
pub struct RelayMetrics {
    connections_total: Counter,
    auth_failures: Counter,
    online_identities: Gauge,
    sends_total: Counter,
    envelopes_persisted: Counter,
    persistence_failures: Counter,
    live_deliveries: Counter,
    unknown_identity_drops: Counter,
    key_format_errors: Counter,
    keys_registered: Counter,
    history_queries: Counter,
    registry: Registry,
    start_time: Instant,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let c = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let online_identities = Gauge::with_opts(Opts::new(
            "pqchat_relay_online_identities",
            "Identities with a live endpoint",
        ))?;
        registry.register(Box::new(online_identities.clone()))?;

        Ok(Self {
            connections_total: counter(
                &registry,
                "pqchat_relay_connections_total",
                "Authenticated connections accepted",
            )?,
            auth_failures: counter(
                &registry,
                "pqchat_relay_auth_failures_total",
                "Handshakes rejected for missing or invalid credentials",
            )?,
            online_identities,
            sends_total: counter(&registry, "pqchat_relay_sends_total", "Send requests received")?,
            envelopes_persisted: counter(
                &registry,
                "pqchat_relay_envelopes_persisted_total",
                "Envelopes appended to the message store",
            )?,
            persistence_failures: counter(
                &registry,
                "pqchat_relay_persistence_failures_total",
                "Envelopes the message store failed to append",
            )?,
            live_deliveries: counter(
                &registry,
                "pqchat_relay_live_deliveries_total",
                "Receiver copies forwarded to an online endpoint",
            )?,
            unknown_identity_drops: counter(
                &registry,
                "pqchat_relay_unknown_identity_drops_total",
                "Sends dropped because a party had no published key",
            )?,
            key_format_errors: counter(
                &registry,
                "pqchat_relay_key_format_errors_total",
                "Sends aborted because a published key was malformed",
            )?,
            keys_registered: counter(
                &registry,
                "pqchat_relay_keys_registered_total",
                "Public keys published",
            )?,
            history_queries: counter(
                &registry,
                "pqchat_relay_history_queries_total",
                "Conversation history requests served",
            )?,
            registry,
            start_time: Instant::now(),
        })
    }

    pub fn record_connection(&self) {
        self.connections_total.inc();
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.inc();
    }

    pub fn set_online(&self, count: usize) {
        self.online_identities.set(count as f64);
    }

    pub fn record_send(&self) {
        self.sends_total.inc();
    }

    pub fn record_persisted(&self) {
        self.envelopes_persisted.inc();
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.inc();
    }

    pub fn record_delivery(&self) {
        self.live_deliveries.inc();
    }

    pub fn record_unknown_identity(&self) {
        self.unknown_identity_drops.inc();
    }

    pub fn record_key_format_error(&self) {
        self.key_format_errors.inc();
    }

    pub fn record_key_registered(&self) {
        self.keys_registered.inc();
    }

    pub fn record_history_query(&self) {
        self.history_queries.inc();
    }

    pub fn sends(&self) -> f64 {
        self.sends_total.get()
    }

    pub fn persisted(&self) -> f64 {
        self.envelopes_persisted.get()
    }

    pub fn persistence_failures(&self) -> f64 {
        self.persistence_failures.get()
    }

    pub fn deliveries(&self) -> f64 {
        self.live_deliveries.get()
    }

    pub fn unknown_identity_drops(&self) -> f64 {
        self.unknown_identity_drops.get()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
