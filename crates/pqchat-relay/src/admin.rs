//! Admin API for relay management

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, Router},
    Json,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::metrics::RelayMetrics;
use crate::presence::PresenceDirectory;

#[derive(Clone)]
pub struct AdminState {
    pub presence: Arc<PresenceDirectory>,
    pub metrics: Arc<RelayMetrics>,
    pub admin_token: String,
}

/// Admin API server
pub struct AdminApi {
    state: AdminState,
}

impl AdminApi {
    pub fn new(presence: Arc<PresenceDirectory>, metrics: Arc<RelayMetrics>, admin_token: String) -> Self {
        Self {
            state: AdminState {
                presence,
                metrics,
                admin_token,
            },
        }
    }

    /// Create admin API router
    pub fn router(&self) -> Router {
        Router::new()
            .route("/admin/presence", get(list_presence))
            .route("/admin/stats", get(get_stats))
            .with_state(self.state.clone())
    }
}

/// Check admin authentication
fn check_auth(headers: &HeaderMap, expected_token: &str) -> bool {
    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("");

    !token.is_empty() && token == expected_token
}

/// List identities with a live endpoint
async fn list_presence(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<PresenceResponse>, StatusCode> {
    if !check_auth(&headers, &state.admin_token) {
        warn!("Admin API authentication failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let online: Vec<String> = state
        .presence
        .online_identities()
        .into_iter()
        .map(|id| id.into_string())
        .collect();
    let total = online.len();
    info!("Admin API: list presence ({} online)", total);

    Ok(Json(PresenceResponse { online, total }))
}

async fn get_stats(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<RelayStats>, StatusCode> {
    if !check_auth(&headers, &state.admin_token) {
        warn!("Admin API authentication failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(Json(RelayStats {
        online_identities: state.presence.online_count(),
        sends: state.metrics.sends() as u64,
        envelopes_persisted: state.metrics.persisted() as u64,
        persistence_failures: state.metrics.persistence_failures() as u64,
        live_deliveries: state.metrics.deliveries() as u64,
        unknown_identity_drops: state.metrics.unknown_identity_drops() as u64,
        uptime_seconds: state.metrics.uptime().as_secs(),
    }))
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub online: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub online_identities: usize,
    pub sends: u64,
    pub envelopes_persisted: u64,
    pub persistence_failures: u64,
    pub live_deliveries: u64,
    pub unknown_identity_drops: u64,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pqchat_crypto::Identity;
    use tokio::sync::mpsc;

    use crate::presence::Endpoint;

    const TOKEN: &str = "0123456789abcdef";

    fn state() -> AdminState {
        AdminState {
            presence: Arc::new(PresenceDirectory::new()),
            metrics: Arc::new(RelayMetrics::new().unwrap()),
            admin_token: TOKEN.to_string(),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_check_auth() {
        assert!(check_auth(&bearer(TOKEN), TOKEN));
        assert!(!check_auth(&bearer("wrong"), TOKEN));
        assert!(!check_auth(&HeaderMap::new(), TOKEN));
    }

    #[tokio::test]
    async fn test_presence_listing() {
        let state = state();
        let (tx, _rx) = mpsc::unbounded_channel();
        state.presence.connect(
            Identity::parse("bob").unwrap(),
            Endpoint::new(state.presence.next_connection_id(), tx),
        );

        let Json(body) = list_presence(State(state.clone()), bearer(TOKEN)).await.unwrap();
        assert_eq!(body.online, vec!["bob".to_string()]);
        assert_eq!(body.total, 1);

        let err = list_presence(State(state), HeaderMap::new()).await.unwrap_err();
        assert_eq!(err, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state();
        state.metrics.record_send();
        state.metrics.record_persisted();
        let Json(stats) = get_stats(State(state), bearer(TOKEN)).await.unwrap();
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.envelopes_persisted, 1);
        assert_eq!(stats.online_identities, 0);
    }
}
