//! Crate-wide error type and its single translation point into a JSON-RPC
//! error object + transport status code (spec §7, §9 "exceptions for flow
//! control" re-architecture note).

use axum::http::StatusCode;
use serde_json::{json, Value};

use crate::logging::mask_secret;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Parse error")]
    ParseError,
    #[error("Invalid Request")]
    InvalidRequest,
    #[error("Method not found")]
    MethodNotFound,
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("Session ID required")]
    SessionRequired,
    #[error("Authorization required")]
    AuthorizationRequired,
    #[error("{0}")]
    InvalidToken(String),
    #[error("{0}")]
    ToolError(String),
    #[error("{0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// JSON-RPC 2.0 error code, per the table in spec §7.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            GatewayError::ParseError => -32700,
            GatewayError::InvalidRequest => -32600,
            GatewayError::MethodNotFound => -32601,
            GatewayError::InvalidParams(_) => -32602,
            GatewayError::SessionRequired => -32000,
            GatewayError::AuthorizationRequired => -32001,
            GatewayError::InvalidToken(_) => -32001,
            GatewayError::ToolError(_) => -32000,
            GatewayError::NotFound(_) => -32000,
            GatewayError::Config(_) => -32000,
            GatewayError::Upstream(_) => -32000,
            GatewayError::Internal(_) => -32603,
        }
    }

    /// Transport-level status code. Most JSON-RPC errors travel over a 200
    /// (the error lives in the body); a handful of session/auth failures use
    /// a distinct transport code per spec §4.5/§7.
    pub fn transport_status(&self) -> StatusCode {
        match self {
            GatewayError::SessionRequired => StatusCode::BAD_REQUEST,
            GatewayError::AuthorizationRequired | GatewayError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Config(_) | GatewayError::Upstream(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::OK,
        }
    }

    /// Redacted, user-facing message. Never leaks stack traces or raw secrets.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(msg) => format!("Internal error: {}", redact(msg)),
            GatewayError::Upstream(msg) => redact(msg),
            _ => self.to_string(),
        }
    }

    pub fn to_json_rpc_error(&self) -> Value {
        json!({ "code": self.json_rpc_code(), "message": self.public_message() })
    }
}

/// Best-effort redaction of bearer-looking substrings from a free-text message.
fn redact(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    for word in msg.split_whitespace() {
        if word.len() > 20 && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.') {
            out.push_str(&mask_secret(word));
        } else {
            out.push_str(word);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_required_maps_to_400() {
        let e = GatewayError::SessionRequired;
        assert_eq!(e.transport_status(), StatusCode::BAD_REQUEST);
        assert_eq!(e.json_rpc_code(), -32000);
    }

    #[test]
    fn auth_required_maps_to_401_with_32001() {
        let e = GatewayError::AuthorizationRequired;
        assert_eq!(e.transport_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(e.json_rpc_code(), -32001);
    }

    #[test]
    fn not_found_maps_to_404() {
        let e = GatewayError::NotFound("transaction tx_1 not found".into());
        assert_eq!(e.transport_status(), StatusCode::NOT_FOUND);
        assert_eq!(e.json_rpc_code(), -32000);
    }

    #[test]
    fn internal_errors_are_redacted() {
        let e = GatewayError::Internal("token abcdefghijklmnopqrstuvwxyz123456 leaked".into());
        let msg = e.public_message();
        assert!(!msg.contains("abcdefghijklmnopqrstuvwxyz123456"));
        assert!(msg.starts_with("Internal error:"));
    }
}
