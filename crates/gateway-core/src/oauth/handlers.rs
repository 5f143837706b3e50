//! HTTP handlers for the OAuth 2.1 authorization server (spec §4.3).

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::http::external_base_url;
use crate::ids::opaque_token;
use crate::model::{now, AuthorizationCode, PendingUpstreamConsent, TokenExtra, AUTH_CODE_TTL_SECS};
use crate::oauth::policy::{auto_register, is_allowed_redirect, new_registration};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    pub scope: Option<String>,
    pub token_endpoint_auth_method: Option<String>,
}

/// `POST /oauth/register` -- dynamic client registration.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.redirect_uris.is_empty() {
        return bad_request("redirect_uris is required");
    }
    let production = state.config.enable_env.is_production();
    if production {
        for uri in &req.redirect_uris {
            if !is_allowed_redirect(uri, true) {
                return bad_request(&format!("redirect_uri not allowed in production: {uri}"));
            }
        }
    }
    let client = new_registration(req.redirect_uris, req.scope, req.token_endpoint_auth_method);
    state.store.insert_client(client.clone());
    (StatusCode::CREATED, Json(client_json(&client))).into_response()
}

fn client_json(client: &crate::model::RegisteredClient) -> Value {
    json!({
        "client_id": client.client_id,
        "client_secret": client.client_secret,
        "redirect_uris": client.redirect_uris,
        "grant_types": client.grant_types,
        "response_types": client.response_types,
        "scope": client.scope,
        "token_endpoint_auth_method": client.token_endpoint_auth_method,
        "client_id_issued_at": client.client_id_issued_at,
    })
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub resource: Option<String>,
    pub aspsp_name: Option<String>,
    pub aspsp_country: Option<String>,
}

/// `GET /oauth/authorize` -- resolves/auto-registers the client, then starts
/// an upstream consent session (spec §4.3 "/authorize algorithm").
pub async fn authorize(
    State(state): State<AppState>,
    Query(q): Query<AuthorizeQuery>,
    headers: HeaderMap,
) -> Response {
    let (Some(client_id), Some(redirect_uri)) = (q.client_id.clone(), q.redirect_uri.clone()) else {
        return bad_request("client_id and redirect_uri are required");
    };
    let production = state.config.enable_env.is_production();

    let client = match state.store.get_client(&client_id) {
        Some(client) => {
            if !client.redirect_uris.iter().any(|u| u == &redirect_uri) {
                return bad_request("redirect_uri does not match registered client");
            }
            client
        }
        None => {
            if is_allowed_redirect(&redirect_uri, production) {
                let scope = q.scope.clone().unwrap_or_else(|| "accounts transactions".to_string());
                let client = auto_register(&client_id, &redirect_uri, &scope);
                state.store.insert_client(client.clone());
                client
            } else {
                return Html(
                    "<html><body><h1>Unknown client</h1><p>Register this client with \
                     <code>POST /oauth/register</code> before starting authorization.</p></body></html>",
                )
                .into_response();
            }
        }
    };

    state.store.sweep_expired();

    let scope = q.scope.clone().unwrap_or_else(|| client.scope.clone());
    let upstream_state = opaque_token();
    let base = external_base_url(&headers, production, &state.config.listen_addr());
    let callback_uri = format!("{base}/oauth/enable-banking/callback");

    state.store.insert_pending_consent(PendingUpstreamConsent {
        upstream_state: upstream_state.clone(),
        client_id: client.client_id.clone(),
        client_redirect_uri: redirect_uri.clone(),
        scope,
        client_state: q.state.clone(),
        resource: q.resource.clone(),
        callback_uri: callback_uri.clone(),
        created_at: now(),
    });

    let Some(upstream) = state.upstream.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "upstream banking client is not configured" })))
            .into_response();
    };

    let aspsp_id = q.aspsp_name.clone().or_else(|| state.config.aspsp_id.clone()).unwrap_or_else(|| "MOCKASPSP_SANDBOX".to_string());
    let aspsp_country = q.aspsp_country.clone().or_else(|| state.config.aspsp_country.clone()).unwrap_or_else(|| "FI".to_string());

    match upstream.initiate_consent(&aspsp_id, &aspsp_country, &callback_uri, &upstream_state).await {
        Ok(consent) => {
            let body = format!(
                "<html><body>Redirecting… <a href=\"{url}\">Continue to your bank</a></body></html>",
                url = consent.url
            );
            let mut resp = Html(body).into_response();
            *resp.status_mut() = StatusCode::FOUND;
            resp.headers_mut().insert(
                "location",
                consent.url.parse().unwrap_or_else(|_| "/".parse().unwrap()),
            );
            resp
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": e.public_message() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

/// `GET /oauth/enable-banking/callback` -- exchanges the upstream code and
/// mints a local authorization code (spec §4.3 "Upstream callback").
pub async fn callback(State(state): State<AppState>, Query(q): Query<CallbackQuery>) -> Response {
    let (Some(code), Some(upstream_state)) = (q.code, q.state) else {
        return bad_request("code and state are required");
    };
    let Some(pending) = state.store.take_pending_consent(&upstream_state) else {
        return bad_request("unknown or expired state");
    };
    let Some(upstream) = state.upstream.as_ref() else {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "upstream banking client is not configured" })))
            .into_response();
    };

    let tokens = match upstream.exchange_code(&code, &pending.callback_uri).await {
        Ok(tokens) => tokens,
        Err(e) => return bad_request(&format!("upstream error: {}", e.public_message())),
    };

    let extra = TokenExtra::default().with_upstream_tokens(&tokens);
    let local_code = opaque_token();
    state.store.insert_code(AuthorizationCode {
        code: local_code.clone(),
        client_id: pending.client_id,
        redirect_uri: pending.client_redirect_uri.clone(),
        scope: pending.scope,
        state: pending.client_state.clone(),
        resource: pending.resource,
        code_challenge: None,
        code_challenge_method: None,
        issued_at: now(),
        expires_at: now() + AUTH_CODE_TTL_SECS,
        extra,
    });

    let mut location = format!("{}?code={}", pending.client_redirect_uri, local_code);
    if let Some(client_state) = pending.client_state {
        location.push_str(&format!("&state={client_state}"));
    }
    Redirect::to(&location).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub resource: Option<String>,
}

fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let encoded = raw.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

fn parse_token_body(content_type: &str, body: &Bytes) -> Result<TokenRequest, ()> {
    if content_type.starts_with("application/json") {
        serde_json::from_slice(body).map_err(|_| ())
    } else {
        serde_urlencoded::from_bytes(body).map_err(|_| ())
    }
}

/// `POST /oauth/token` -- authorization_code and refresh_token grants.
pub async fn token(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/x-www-form-urlencoded")
        .to_string();
    let Ok(mut req) = parse_token_body(&content_type, &body) else {
        return bad_request("malformed request body");
    };

    if let Some((basic_id, basic_secret)) = parse_basic_auth(&headers) {
        if let Some(form_id) = &req.client_id {
            if form_id != &basic_id {
                return unauthorized("client_id mismatch between Basic auth and request body");
            }
        }
        req.client_id = Some(basic_id);
        req.client_secret = Some(basic_secret);
    }

    let production = state.config.enable_env.is_production();

    match req.grant_type.as_deref() {
        Some("authorization_code") => authorization_code_grant(&state, req, production).await,
        Some("refresh_token") => refresh_token_grant(&state, req).await,
        _ => bad_request_json("unsupported_grant_type", "grant_type must be authorization_code or refresh_token"),
    }
}

async fn authorization_code_grant(state: &AppState, req: TokenRequest, production: bool) -> Response {
    let Some(code) = req.code.clone() else {
        return bad_request_json("invalid_request", "code is required");
    };

    match state.store.redeem_code(&code) {
        Some(ac) => {
            let client_id = req.client_id.clone().unwrap_or_else(|| ac.client_id.clone());
            if client_id != ac.client_id {
                return bad_request_json("invalid_grant", "client_id does not match authorization code");
            }
            if let Some(client) = state.store.get_client(&client_id) {
                if let Some(err) = validate_client_credentials(&client, &req) {
                    return err;
                }
            }
            if let Some(redirect_uri) = &req.redirect_uri {
                if redirect_uri != &ac.redirect_uri {
                    return bad_request_json("invalid_grant", "redirect_uri does not match authorization code");
                }
            }
            if let Some(resource) = &req.resource {
                if ac.resource.as_deref() != Some(resource.as_str()) {
                    return bad_request_json("invalid_target", "resource does not match authorization code");
                }
            }
            let (access, refresh) = state.store.issue_token_pair(
                opaque_token(),
                opaque_token(),
                client_id,
                ac.scope,
                ac.resource,
                ac.extra,
            );
            token_response(&access, &refresh)
        }
        None if !production => {
            let client_id = req.client_id.clone().unwrap_or_else(crate::ids::client_id);
            let redirect_uri = req.redirect_uri.clone().unwrap_or_default();
            let scope = "accounts transactions".to_string();
            if state.store.get_client(&client_id).is_none() {
                state.store.insert_client(auto_register(&client_id, &redirect_uri, &scope));
            }
            let (access, refresh) = state.store.issue_token_pair(
                opaque_token(),
                opaque_token(),
                client_id,
                scope,
                req.resource.clone(),
                TokenExtra::default(),
            );
            token_response(&access, &refresh)
        }
        None => bad_request_json("invalid_grant", "authorization code not found or expired"),
    }
}

async fn refresh_token_grant(state: &AppState, req: TokenRequest) -> Response {
    let Some(old_refresh) = req.refresh_token.clone() else {
        return bad_request_json("invalid_request", "refresh_token is required");
    };
    let Some(existing) = state.store.get_refresh_token(&old_refresh) else {
        return bad_request_json("invalid_grant", "refresh token not found or expired");
    };
    if let Some(client_id) = &req.client_id {
        if client_id != &existing.client_id {
            return bad_request_json("invalid_grant", "client_id does not match refresh token");
        }
    }
    if let Some(resource) = &req.resource {
        if existing.resource.as_deref() != Some(resource.as_str()) {
            return bad_request_json("invalid_target", "resource does not match refresh token");
        }
    }
    match state.store.rotate_refresh_token(&old_refresh, opaque_token(), opaque_token()) {
        Some((access, refresh)) => token_response(&access, &refresh),
        None => bad_request_json("invalid_grant", "refresh token not found or expired"),
    }
}

fn validate_client_credentials(client: &crate::model::RegisteredClient, req: &TokenRequest) -> Option<Response> {
    if !client.is_confidential() {
        return None;
    }
    match (&client.client_secret, &req.client_secret) {
        (Some(expected), Some(provided)) if expected == provided => None,
        _ => Some(unauthorized("invalid client credentials")),
    }
}

fn token_response(access: &crate::model::AccessToken, refresh: &crate::model::RefreshToken) -> Response {
    Json(json!({
        "access_token": access.access_token,
        "refresh_token": refresh.refresh_token,
        "token_type": "Bearer",
        "expires_in": access.expires_at - access.issued_at,
        "scope": access.scope,
        "resource": access.resource,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>,
}

/// `POST /oauth/revoke` -- RFC 7009, idempotent.
pub async fn revoke(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/x-www-form-urlencoded");
    let req: RevokeRequest = if content_type.starts_with("application/json") {
        serde_json::from_slice(&body).unwrap_or(RevokeRequest { token: None })
    } else {
        serde_urlencoded::from_bytes(&body).unwrap_or(RevokeRequest { token: None })
    };
    let Some(token) = req.token else {
        return bad_request("token is required");
    };
    state.store.revoke_token(&token);
    Json(json!({})).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn bad_request_json(error: &str, description: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": error, "error_description": description }))).into_response()
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}
