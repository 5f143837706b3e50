//! C8: HTTP Front. CORS origin policing, proxy-aware external-base-URL
//! derivation, and the health/manifest endpoints (spec §4.8).

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::server::AppState;

/// Origin prefixes allowed to call the gateway from a browser (spec §6).
pub const ALLOWED_ORIGINS: &[&str] = &[
    "https://claude.ai",
    "https://www.claude.ai",
    "https://app.claude.ai",
    "https://lite.claude.ai",
    "https://chat.openai.com",
    "https://www.chat.openai.com",
    "https://chatgpt.com",
    "https://www.chatgpt.com",
    "https://platform.openai.com",
    "http://localhost:3000",
    "http://127.0.0.1:3000",
];

fn origin_allowed(origin: &str) -> bool {
    ALLOWED_ORIGINS.iter().any(|p| origin.starts_with(p))
}

fn cors_headers(resp: &mut Response, origin: Option<&HeaderValue>) {
    let headers = resp.headers_mut();
    if let Some(origin) = origin {
        headers.insert("access-control-allow-origin", origin.clone());
    }
    headers.insert("access-control-allow-methods", HeaderValue::from_static("GET, POST, OPTIONS"));
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("content-type, authorization, mcp-protocol-version, mcp-session-id"),
    );
    headers.insert("access-control-allow-credentials", HeaderValue::from_static("true"));
}

/// Middleware: 200s every `OPTIONS` preflight; for other methods, refuses
/// any `Origin` outside the allow-list with 403 and otherwise stamps CORS
/// headers on the response.
pub async fn cors_guard(req: Request<Body>, next: Next) -> Response {
    let origin = req.headers().get("origin").cloned();
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::OK.into_response();
        cors_headers(&mut resp, origin.as_ref());
        return resp;
    }
    if let Some(origin_value) = &origin {
        let origin_str = origin_value.to_str().unwrap_or("");
        if !origin_str.is_empty() && !origin_allowed(origin_str) {
            return (StatusCode::FORBIDDEN, Json(json!({ "error": "Invalid origin" }))).into_response();
        }
    }
    let mut resp = next.run(req).await;
    cors_headers(&mut resp, origin.as_ref());
    resp
}

/// Derives the externally visible base URL (scheme + host, no trailing
/// slash) honouring reverse-proxy headers. Production hostnames always get
/// `https` regardless of what the proxy claims (spec §4.3).
pub fn external_base_url(headers: &HeaderMap, is_production: bool, fallback_host: &str) -> String {
    let host = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get("host").and_then(|v| v.to_str().ok()))
        .unwrap_or(fallback_host)
        .to_string();

    let mut scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if scheme.is_none() {
        if let Some(cf) = headers.get("cf-visitor").and_then(|v| v.to_str().ok()) {
            if cf.contains("\"scheme\":\"https\"") {
                scheme = Some("https".to_string());
            }
        }
    }

    let mut scheme = scheme.unwrap_or_else(|| "http".to_string());
    if is_production {
        scheme = "https".to_string();
    }

    format!("{scheme}://{host}")
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// `GET /.well-known/mcp.json` -- supported protocol versions, transport
/// endpoint, capabilities, and a pointer at the OAuth metadata.
pub async fn manifest(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let base = external_base_url(&headers, state.config.enable_env.is_production(), &state.config.listen_addr());
    Json(json!({
        "protocolVersions": ["2025-06-18", "2025-03-26"],
        "transport": { "type": "streamable-http", "endpoint": format!("{base}/mcp") },
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false },
            "prompts": { "listChanged": false }
        },
        "authorization": {
            "authorization_servers": [crate::oauth::metadata::issuer(&state, &base)],
            "resource": base
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_prefix_matches_are_allowed() {
        assert!(origin_allowed("https://claude.ai"));
        assert!(origin_allowed("https://chatgpt.com"));
        assert!(!origin_allowed("https://evil.example.com"));
    }

    #[test]
    fn forwarded_headers_drive_external_base() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("gateway.example.com"));
        let base = external_base_url(&headers, false, "0.0.0.0:8787");
        assert_eq!(base, "https://gateway.example.com");
    }

    #[test]
    fn production_forces_https_even_if_proxy_says_otherwise() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("gateway.example.com"));
        let base = external_base_url(&headers, true, "0.0.0.0:8787");
        assert_eq!(base, "https://gateway.example.com");
    }

    #[test]
    fn falls_back_to_bind_addr_without_headers() {
        let headers = HeaderMap::new();
        let base = external_base_url(&headers, false, "0.0.0.0:8787");
        assert_eq!(base, "http://0.0.0.0:8787");
    }
}
