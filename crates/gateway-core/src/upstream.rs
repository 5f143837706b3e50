//! C1: Upstream Banking Client. Signs RS256 JWTs for Enable Banking API
//! authentication and wraps the consent / token / accounts / transactions
//! endpoints (spec §4.1).

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::logging::mask_secret;
use crate::model::{now, UpstreamTokens};

const BASE_URL: &str = "https://api.enablebanking.com";
const JWT_TTL_SECS: i64 = 3600;
const JWT_MAX_TTL_SECS: i64 = 86400;

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_tokens(self) -> UpstreamTokens {
        UpstreamTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_in.map(|ttl| now() + ttl),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsentInitiation {
    pub url: String,
    pub authorization_id: Option<String>,
}

/// Client for the Enable Banking API. One instance per process; the private
/// key is read from disk once at construction and kept in memory.
pub struct UpstreamClient {
    http: reqwest::Client,
    app_id: String,
    private_key_pem: Vec<u8>,
    base_url: String,
}

impl UpstreamClient {
    /// Builds a client from the process configuration. Returns
    /// [`GatewayError::Config`] when the app id or private key is missing or
    /// unreadable -- callers should surface this as "banking tools
    /// unavailable" rather than a panic.
    pub fn from_config(cfg: &GatewayConfig) -> Result<Self, GatewayError> {
        let app_id = cfg
            .enable_app_id
            .clone()
            .ok_or_else(|| GatewayError::Config("ENABLE_APP_ID is not set".into()))?;
        let key_path = cfg
            .enable_private_key_path
            .clone()
            .ok_or_else(|| GatewayError::Config("ENABLE_PRIVATE_KEY_PATH is not set".into()))?;
        let private_key_pem = std::fs::read(&key_path).map_err(|e| {
            GatewayError::Config(format!("failed to read private key {key_path}: {e}"))
        })?;
        Ok(Self {
            http: reqwest::Client::new(),
            app_id,
            private_key_pem,
            base_url: cfg.enable_base_url.clone().unwrap_or_else(|| BASE_URL.to_string()),
        })
    }

    #[cfg(test)]
    fn with_base_url(app_id: &str, private_key_pem: Vec<u8>, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            app_id: app_id.to_string(),
            private_key_pem,
            base_url,
        }
    }

    /// Signs a fresh RS256 JWT: header `{typ, alg, kid=app_id}`, payload
    /// `{iss: enablebanking.com, aud: api.enablebanking.com, iat, exp}`.
    /// `exp` never exceeds `iat + 86400` per the upstream's own limit.
    fn sign_jwt(&self) -> Result<String, GatewayError> {
        let iat = now();
        let exp = (iat + JWT_TTL_SECS).min(iat + JWT_MAX_TTL_SECS);
        let claims = JwtClaims {
            iss: "enablebanking.com".to_string(),
            aud: "api.enablebanking.com".to_string(),
            iat,
            exp,
        };
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.app_id.clone());
        let key = EncodingKey::from_rsa_pem(&self.private_key_pem)
            .map_err(|e| GatewayError::Config(format!("invalid private key: {e}")))?;
        encode(&header, &claims, &key)
            .map_err(|e| GatewayError::Internal(format!("jwt signing failed: {e}")))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST /auth -- starts a consent session for the given bank, returning
    /// the URL the end user must be redirected to.
    pub async fn initiate_consent(
        &self,
        aspsp_id: &str,
        aspsp_country: &str,
        redirect_url: &str,
        state: &str,
    ) -> Result<ConsentInitiation, GatewayError> {
        let jwt = self.sign_jwt()?;
        let valid_until = chrono::Utc::now() + chrono::Duration::days(90);
        let body = json!({
            "access": { "valid_until": valid_until.to_rfc3339() },
            "aspsp": { "name": aspsp_id, "country": aspsp_country },
            "redirect_url": redirect_url,
            "psu_type": "personal",
            "state": state,
        });
        let resp = self
            .http
            .post(self.url("/auth"))
            .bearer_auth(jwt)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("consent initiation failed: {e}")))?;
        let resp = check_status(resp).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed consent response: {e}")))?;
        let url = value
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Upstream("consent response missing url".into()))?
            .to_string();
        let authorization_id = value
            .get("authorization_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ConsentInitiation { url, authorization_id })
    }

    /// POST /auth/token, authorization_code grant. Not subject to the
    /// 401-retry-once rule -- there is no prior access token to retry with.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamTokens, GatewayError> {
        let jwt = self.sign_jwt()?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.app_id.as_str()),
        ];
        let resp = self
            .http
            .post(self.url("/auth/token"))
            .bearer_auth(jwt)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("code exchange failed: {e}")))?;
        let resp = check_status(resp).await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed token response: {e}")))?;
        Ok(token.into_tokens())
    }

    /// POST /auth/token, refresh_token grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<UpstreamTokens, GatewayError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.app_id.as_str()),
        ];
        let resp = self
            .http
            .post(self.url("/auth/token"))
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("token refresh failed: {e}")))?;
        let resp = check_status(resp).await?;
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed refresh response: {e}")))?;
        tracing::info!(target = "upstream", token = %mask_secret(&token.access_token), "refreshed upstream token");
        Ok(token.into_tokens())
    }

    /// GET /accounts. Retries exactly once, after a refresh, on a 401.
    pub async fn list_accounts(
        &self,
        tokens: &UpstreamTokens,
    ) -> Result<(Vec<Value>, Option<UpstreamTokens>), GatewayError> {
        let (value, refreshed) = self
            .get_with_retry("/accounts", &[], tokens)
            .await?;
        let accounts = value
            .get("accounts")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok((accounts, refreshed))
    }

    /// GET /accounts/{id}/transactions. Retries exactly once, after a
    /// refresh, on a 401.
    pub async fn list_transactions(
        &self,
        account_id: &str,
        date_from: Option<&str>,
        date_to: Option<&str>,
        tokens: &UpstreamTokens,
    ) -> Result<(Vec<Value>, Option<UpstreamTokens>), GatewayError> {
        let mut query = Vec::new();
        if let Some(f) = date_from {
            query.push(("date_from", f));
        }
        if let Some(t) = date_to {
            query.push(("date_to", t));
        }
        let path = format!("/accounts/{account_id}/transactions");
        let (value, refreshed) = self.get_with_retry(&path, &query, tokens).await?;
        let booked = value
            .get("transactions")
            .and_then(|v| v.get("booked"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok((booked, refreshed))
    }

    async fn get_with_retry(
        &self,
        path: &str,
        query: &[(&str, &str)],
        tokens: &UpstreamTokens,
    ) -> Result<(Value, Option<UpstreamTokens>), GatewayError> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(&tokens.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(format!("request to {path} failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            let refresh_token = tokens
                .refresh_token
                .as_ref()
                .ok_or_else(|| GatewayError::InvalidToken("upstream token expired".into()))?;
            let refreshed = self.refresh(refresh_token).await?;
            let resp = self
                .http
                .get(self.url(path))
                .bearer_auth(&refreshed.access_token)
                .query(query)
                .send()
                .await
                .map_err(|e| GatewayError::Upstream(format!("retry to {path} failed: {e}")))?;
            let resp = check_status(resp).await?;
            let value: Value = resp
                .json()
                .await
                .map_err(|e| GatewayError::Upstream(format!("malformed response from {path}: {e}")))?;
            return Ok((value, Some(refreshed)));
        }

        let resp = check_status(resp).await?;
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("malformed response from {path}: {e}")))?;
        Ok((value, None))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(GatewayError::Upstream(format!("upstream returned {status}: {body}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit RSA test key, PKCS#8 PEM, generated offline for this suite only.
    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_private_key.pem");

    #[test]
    fn jwt_claims_respect_upstream_limits() {
        let client = UpstreamClient::with_base_url(
            "app-123",
            TEST_PRIVATE_KEY.as_bytes().to_vec(),
            "https://example.invalid".to_string(),
        );
        let jwt = client.sign_jwt().expect("jwt should sign");
        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("app-123"));

        let mut validation = jsonwebtoken::Validation::new(Algorithm::RS256);
        validation.set_audience(&["api.enablebanking.com"]);
        validation.set_issuer(&["enablebanking.com"]);
        let decoding_key = {
            let priv_pem = TEST_PRIVATE_KEY.as_bytes();
            let doc = jsonwebtoken::EncodingKey::from_rsa_pem(priv_pem).unwrap();
            let _ = doc; // encoding-key only proves signing worked; decode via public key below
            jsonwebtoken::DecodingKey::from_rsa_pem(include_bytes!(
                "../tests/fixtures/test_rsa_public_key.pem"
            ))
            .unwrap()
        };
        let data = jsonwebtoken::decode::<JwtClaims>(&jwt, &decoding_key, &validation).unwrap();
        assert!(data.claims.exp - data.claims.iat <= JWT_MAX_TTL_SECS);
        assert_eq!(data.claims.iss, "enablebanking.com");
        assert_eq!(data.claims.aud, "api.enablebanking.com");
    }

    #[test]
    fn missing_config_is_reported_as_config_error() {
        let cfg = GatewayConfig {
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
        };
        let err = UpstreamClient::from_config(&cfg).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }
}
