//! Redirect-URI allow-list and auto-registration policy (spec §4.3, §6, §9
//! "Auto-registration of well-known remote clients").

use crate::ids::{client_id, client_secret};
use crate::model::{now, RegisteredClient};

/// Prefixes accepted both as a registered client's `redirect_uri` and as the
/// trigger for lazily materialising a public client at `/authorize`.
pub const REMOTE_REDIRECT_PREFIXES: &[&str] = &[
    "https://claude.ai/",
    "https://www.claude.ai/",
    "https://app.claude.ai/",
    "https://lite.claude.ai/",
    "https://chat.openai.com/",
    "https://www.chat.openai.com/",
    "https://chatgpt.com/",
    "https://www.chatgpt.com/",
];

/// Well-known callback URIs appended to every registered client's redirect
/// set, so a single static client id can serve every remote platform.
pub const WELL_KNOWN_CALLBACKS: &[&str] = &[
    "https://claude.ai/api/mcp/auth_callback",
    "https://chat.openai.com/aip/api/auth/callback",
    "https://chatgpt.com/aip/api/auth/callback",
];

fn is_remote_prefix(uri: &str) -> bool {
    REMOTE_REDIRECT_PREFIXES.iter().any(|p| uri.starts_with(p))
}

fn is_loopback(uri: &str) -> bool {
    uri.starts_with("http://localhost") || uri.starts_with("http://127.0.0.1")
}

/// A redirect URI is allowed if it matches a remote prefix, or -- outside
/// production -- is a loopback URI.
pub fn is_allowed_redirect(uri: &str, is_production: bool) -> bool {
    is_remote_prefix(uri) || (!is_production && is_loopback(uri))
}

/// Appends the well-known callback URIs to a freshly registered client's
/// redirect set (insertion-unique), so it also serves the remote platforms
/// without their own `/register` call.
pub fn with_well_known_callbacks(mut redirect_uris: Vec<String>) -> Vec<String> {
    for cb in WELL_KNOWN_CALLBACKS {
        if !redirect_uris.iter().any(|u| u == cb) {
            redirect_uris.push(cb.to_string());
        }
    }
    redirect_uris
}

/// Lazily materialises a public client (`token_endpoint_auth_method=none`)
/// for an unknown `client_id` whose `redirect_uri` matches a remote prefix.
pub fn auto_register(client_id_hint: &str, redirect_uri: &str, scope: &str) -> RegisteredClient {
    RegisteredClient {
        client_id: client_id_hint.to_string(),
        client_secret: None,
        redirect_uris: with_well_known_callbacks(vec![redirect_uri.to_string()]),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        scope: scope.to_string(),
        token_endpoint_auth_method: "none".to_string(),
        client_id_issued_at: now(),
    }
}

/// Builds a brand-new registered client for `POST /oauth/register`.
pub fn new_registration(
    redirect_uris: Vec<String>,
    scope: Option<String>,
    token_endpoint_auth_method: Option<String>,
) -> RegisteredClient {
    let auth_method = token_endpoint_auth_method.unwrap_or_else(|| "client_secret_post".to_string());
    let secret = if auth_method == "none" { None } else { Some(client_secret()) };
    RegisteredClient {
        client_id: client_id(),
        client_secret: secret,
        redirect_uris: with_well_known_callbacks(redirect_uris),
        grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
        response_types: vec!["code".to_string()],
        scope: scope.unwrap_or_else(|| "accounts transactions".to_string()),
        token_endpoint_auth_method: auth_method,
        client_id_issued_at: now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_prefixes_allowed_in_production() {
        assert!(is_allowed_redirect("https://claude.ai/api/mcp/auth_callback", true));
        assert!(!is_allowed_redirect("https://evil.example.com/cb", true));
    }

    #[test]
    fn loopback_only_allowed_outside_production() {
        assert!(is_allowed_redirect("http://localhost:8080/cb", false));
        assert!(!is_allowed_redirect("http://localhost:8080/cb", true));
    }

    #[test]
    fn well_known_callbacks_are_appended_once() {
        let uris = with_well_known_callbacks(vec!["https://claude.ai/api/mcp/auth_callback".to_string()]);
        let count = uris
            .iter()
            .filter(|u| u.as_str() == "https://claude.ai/api/mcp/auth_callback")
            .count();
        assert_eq!(count, 1);
        assert!(uris.len() >= WELL_KNOWN_CALLBACKS.len());
    }

    #[test]
    fn auto_registered_client_is_public() {
        let client = auto_register("chatgpt-test-client", "https://chat.openai.com/aip/api/auth/callback", "accounts");
        assert_eq!(client.token_endpoint_auth_method, "none");
        assert!(client.client_secret.is_none());
        assert!(!client.is_confidential());
    }
}
