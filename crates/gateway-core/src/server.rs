//! Application state and router assembly. Wires every handler module onto
//! concrete routes and spawns the background TTL sweeper (spec §4, §6).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::Value;

use crate::config::GatewayConfig;
use crate::http::{cors_guard, external_base_url, health, manifest};
use crate::oauth::metadata::{authorization_server_metadata, protected_resource_metadata};
use crate::session::SessionManager;
use crate::store::Store;
use crate::upstream::UpstreamClient;

/// Shared, cloneable handle every axum handler receives via `State`.
///
/// Cloning is cheap: every field is an `Arc`. `upstream` is `None` when
/// `ENABLE_APP_ID`/`ENABLE_PRIVATE_KEY_PATH` are absent or unreadable --
/// banking tools degrade to a 503 rather than the process failing to start.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionManager>,
    pub config: Arc<GatewayConfig>,
    pub upstream: Arc<Option<UpstreamClient>>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Self {
        let upstream = match UpstreamClient::from_config(&config) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!(target = "server", error = %err, "banking tools unavailable");
                None
            }
        };
        Self {
            store: Arc::new(Store::new()),
            sessions: Arc::new(SessionManager::new()),
            config: Arc::new(config),
            upstream: Arc::new(upstream),
        }
    }
}

async fn oauth_authorization_server_metadata(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let base = external_base_url(&headers, state.config.enable_env.is_production(), &state.config.listen_addr());
    Json(authorization_server_metadata(&state, &base))
}

async fn oauth_protected_resource_metadata(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let base = external_base_url(&headers, state.config.enable_env.is_production(), &state.config.listen_addr());
    Json(protected_resource_metadata(&state, &base))
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/mcp.json", get(manifest))
        .route("/.well-known/oauth-authorization-server", get(oauth_authorization_server_metadata))
        .route("/.well-known/oauth-protected-resource", get(oauth_protected_resource_metadata))
        .route("/oauth/register", post(crate::oauth::handlers::register))
        .route("/oauth/authorize", get(crate::oauth::handlers::authorize))
        .route("/oauth/enable-banking/callback", get(crate::oauth::handlers::callback))
        .route("/oauth/token", post(crate::oauth::handlers::token))
        .route("/oauth/revoke", post(crate::oauth::handlers::revoke))
        .route("/mcp", post(crate::dispatch::handle_post).get(crate::sse::handle_get))
        .route("/mcp/stream", get(crate::sse::handle_get))
        .route("/mcp/sse", get(crate::sse::handle_get))
        .layer(axum::middleware::from_fn(cors_guard))
        .with_state(state)
}

/// Runs forever, sweeping expired tokens/codes/consents and evicting stale
/// sessions at roughly 1 Hz (spec §4.2/§4.4).
pub async fn spawn_sweeper(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        state.store.sweep_expired();
        state.sessions.cleanup_default().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            enable_app_id: None,
            enable_private_key_path: None,
            enable_env: crate::config::EnableEnv::Sandbox,
            aspsp_id: None,
            aspsp_country: None,
            oauth_redirect_url: None,
            oauth_issuer: None,
            host: "0.0.0.0".into(),
            port: 8787,
            enable_base_url: None,
        }
    }

    #[test]
    fn app_state_degrades_gracefully_without_upstream_config() {
        let state = AppState::new(test_config());
        assert!(state.upstream.is_none());
    }
}
