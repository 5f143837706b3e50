//! RFC 8414 authorization-server metadata and protected-resource metadata
//! (spec §4.3 "Metadata").

use serde_json::{json, Value};

use crate::server::AppState;

/// `issuer` defaults to the external base URL unless `OAUTH_ISSUER` overrides it.
pub fn issuer(state: &AppState, base: &str) -> String {
    state
        .config
        .oauth_issuer
        .clone()
        .unwrap_or_else(|| base.to_string())
}

pub fn authorization_server_metadata(state: &AppState, base: &str) -> Value {
    let iss = issuer(state, base);
    json!({
        "issuer": iss,
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "registration_endpoint": format!("{base}/oauth/register"),
        "revocation_endpoint": format!("{base}/oauth/revoke"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["client_secret_post", "client_secret_basic", "none"],
    })
}

pub fn protected_resource_metadata(state: &AppState, base: &str) -> Value {
    json!({
        "resource": base,
        "authorization_servers": [issuer(state, base)],
        "bearer_methods_supported": ["header"],
    })
}
