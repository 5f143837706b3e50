//! Value types from spec §3. Identifiers marked *(secret)* in the spec carry
//! opaque, unguessable strings generated by [`crate::ids`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub scope: String,
    pub token_endpoint_auth_method: String,
    pub client_id_issued_at: i64,
}

impl RegisteredClient {
    pub fn is_confidential(&self) -> bool {
        self.token_endpoint_auth_method != "none"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenExtra(pub HashMap<String, Value>);

impl TokenExtra {
    pub fn enable_banking_tokens(&self) -> Option<UpstreamTokens> {
        self.0
            .get("enable_banking_tokens")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn with_upstream_tokens(mut self, tokens: &UpstreamTokens) -> Self {
        self.0.insert(
            "enable_banking_tokens".to_string(),
            serde_json::to_value(tokens).unwrap_or(Value::Null),
        );
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl UpstreamTokens {
    /// True when the token must be refreshed before use (spec §3 invariant:
    /// refresh when `expires_at - now <= 30s` and a refresh token exists).
    pub fn needs_refresh(&self, now: i64) -> bool {
        match (self.refresh_token.as_ref(), self.expires_at) {
            (Some(_), Some(exp)) => exp - now <= 30,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: Option<String>,
    pub resource: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub extra: TokenExtra,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub client_id: String,
    pub scope: String,
    pub resource: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub extra: TokenExtra,
    /// Links to the sibling refresh token so `extra` can be kept in lockstep.
    pub refresh_token: Option<String>,
}

impl AccessToken {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    pub refresh_token: String,
    pub client_id: String,
    pub scope: String,
    pub resource: Option<String>,
    pub issued_at: i64,
    pub expires_at: i64,
    pub extra: TokenExtra,
    pub access_token: String,
}

impl RefreshToken {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUpstreamConsent {
    pub upstream_state: String,
    pub client_id: String,
    pub client_redirect_uri: String,
    pub scope: String,
    pub client_state: Option<String>,
    pub resource: Option<String>,
    pub callback_uri: String,
    pub created_at: i64,
}

impl PendingUpstreamConsent {
    pub fn is_expired(&self, now: i64, ttl_secs: i64) -> bool {
        now - self.created_at > ttl_secs
    }
}

pub const AUTH_CODE_TTL_SECS: i64 = 300;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 7 * 86400;
pub const PENDING_CONSENT_TTL_SECS: i64 = 900;
pub const SESSION_TTL_SECS: i64 = 3600;
