//! C5: JSON-RPC / MCP Dispatcher. Header validation, envelope
//! classification, and method routing for `POST /mcp` (spec §4.5).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::logging::{log_rpc_event, RpcEvent};
use crate::oauth::metadata::issuer;
use crate::server::AppState;
use crate::session::{ClientInfo, Session};

const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26"];
const PREFERRED_PROTOCOL_VERSION: &str = "2025-06-18";

struct Envelope {
    id: Option<Value>,
    method: String,
    params: Value,
}

fn classify(body: &Value) -> Result<Envelope, GatewayError> {
    let obj = body.as_object().ok_or(GatewayError::InvalidRequest)?;
    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Err(GatewayError::InvalidRequest);
    }
    let method = obj
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or(GatewayError::InvalidRequest)?
        .to_string();
    Ok(Envelope {
        id: obj.get("id").cloned(),
        method,
        params: obj.get("params").cloned().unwrap_or(Value::Null),
    })
}

fn error_body(id: Option<&Value>, err: &GatewayError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.cloned().unwrap_or(Value::Null),
        "error": err.to_json_rpc_error(),
    })
}

fn success_body(id: Option<&Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id.cloned().unwrap_or(Value::Null), "result": result })
}

/// `POST /mcp` -- validates transport headers, classifies the JSON-RPC
/// envelope, and routes to the method handlers.
pub async fn handle_post(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(resp) = validate_headers(&headers) {
        return resp;
    }

    let parsed: Result<Value, _> = serde_json::from_slice(&body);
    let value = match parsed {
        Ok(v) => v,
        Err(_) => {
            let err = GatewayError::ParseError;
            return (err.transport_status(), Json(error_body(None, &err))).into_response();
        }
    };

    let envelope = match classify(&value) {
        Ok(e) => e,
        Err(err) => {
            let id = value.get("id").cloned();
            return (err.transport_status(), Json(error_body(id.as_ref(), &err))).into_response();
        }
    };

    let is_notification = envelope.id.is_none();
    let session_id = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let started = std::time::Instant::now();
    let outcome = route(&state, &headers, &envelope).await;

    let mut event = RpcEvent::new(envelope.method.clone(), session_id);
    event.duration_ms = Some(started.elapsed().as_millis() as i64);
    event.ok = outcome.is_ok();
    if let Err(err) = &outcome {
        event.error = Some(err.to_string());
    }
    log_rpc_event(event);

    if is_notification {
        return StatusCode::ACCEPTED.into_response();
    }

    match outcome {
        Ok((result, extra_headers)) => {
            let mut resp = Json(success_body(envelope.id.as_ref(), result)).into_response();
            for (name, value) in extra_headers {
                if let (Ok(name), Ok(value)) = (
                    axum::http::HeaderName::try_from(name),
                    axum::http::HeaderValue::from_str(&value),
                ) {
                    resp.headers_mut().insert(name, value);
                }
            }
            resp
        }
        Err(err) => (err.transport_status(), Json(error_body(envelope.id.as_ref(), &err))).into_response(),
    }
}

fn validate_headers(headers: &HeaderMap) -> Option<Response> {
    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).unwrap_or("");
    if !content_type.starts_with("application/json") {
        return Some((StatusCode::UNSUPPORTED_MEDIA_TYPE, "Content-Type must be application/json").into_response());
    }
    if let Some(accept) = headers.get("accept").and_then(|v| v.to_str().ok()) {
        if !accept.contains("application/json") && !accept.contains("*/*") {
            return Some((StatusCode::NOT_ACCEPTABLE, "Accept must admit application/json").into_response());
        }
    }
    if let Some(version) = headers.get("mcp-protocol-version").and_then(|v| v.to_str().ok()) {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Some((StatusCode::BAD_REQUEST, "Unsupported MCP-Protocol-Version").into_response());
        }
    }
    None
}

type ExtraHeaders = Vec<(String, String)>;

async fn route(state: &AppState, headers: &HeaderMap, envelope: &Envelope) -> Result<(Value, ExtraHeaders), GatewayError> {
    match envelope.method.as_str() {
        "initialize" => handle_initialize(state, headers, envelope).await,
        "ping" => handle_ping(state, headers).await,
        "tools/list" => handle_tools_list(state, headers).await,
        "tools/call" => handle_tools_call(state, headers, envelope).await,
        _ => Err(GatewayError::MethodNotFound),
    }
}

/// Every method except `tools/list`/`tools/call` requires an established
/// session (spec §4.5 "Other methods").
async fn handle_ping(state: &AppState, headers: &HeaderMap) -> Result<(Value, ExtraHeaders), GatewayError> {
    resolve_session(state, headers).await.ok_or(GatewayError::SessionRequired)?;
    Ok((json!({}), vec![]))
}

fn requested_protocol_version(headers: &HeaderMap, envelope: &Envelope) -> Result<String, GatewayError> {
    let from_params = envelope.params.get("protocolVersion").and_then(|v| v.as_str());
    let from_header = headers.get("mcp-protocol-version").and_then(|v| v.to_str().ok());
    let requested = from_params.or(from_header).unwrap_or(PREFERRED_PROTOCOL_VERSION);
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&requested) {
        Ok(requested.to_string())
    } else {
        Err(GatewayError::InvalidRequest)
    }
}

async fn handle_initialize(state: &AppState, headers: &HeaderMap, envelope: &Envelope) -> Result<(Value, ExtraHeaders), GatewayError> {
    let protocol_version = requested_protocol_version(headers, envelope)?;
    let client_info = envelope
        .params
        .get("clientInfo")
        .map(|v| ClientInfo {
            name: v.get("name").and_then(|n| n.as_str()).map(|s| s.to_string()),
            version: v.get("version").and_then(|n| n.as_str()).map(|s| s.to_string()),
        })
        .unwrap_or(ClientInfo { name: None, version: None });

    let session = state.sessions.create(&protocol_version, client_info).await;
    let base = crate::http::external_base_url(headers, state.config.enable_env.is_production(), &state.config.listen_addr());
    let iss = issuer(state, &base);

    let result = json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": false },
            "resources": { "subscribe": false, "listChanged": false },
            "prompts": { "listChanged": false }
        },
        "serverInfo": { "name": "enable-mcp-gateway", "version": env!("CARGO_PKG_VERSION") },
        "protectedResourceMetadata": { "resource": base, "authorization_servers": [iss] }
    });

    Ok((result, vec![("Mcp-Session-Id".to_string(), session.id.clone())]))
}

async fn resolve_session(state: &AppState, headers: &HeaderMap) -> Option<Arc<Session>> {
    let id = headers.get("mcp-session-id").and_then(|v| v.to_str().ok())?;
    state.sessions.get(id).await
}

async fn handle_tools_list(state: &AppState, headers: &HeaderMap) -> Result<(Value, ExtraHeaders), GatewayError> {
    // Unauthenticated tool discovery is allowed: synthesise a transient
    // legacy session when none is supplied (spec §4.5 "Other methods").
    if resolve_session(state, headers).await.is_none() {
        state.sessions.create(PREFERRED_PROTOCOL_VERSION, ClientInfo { name: None, version: None }).await;
    }
    Ok((crate::tools::list_json(), vec![]))
}

async fn handle_tools_call(state: &AppState, headers: &HeaderMap, envelope: &Envelope) -> Result<(Value, ExtraHeaders), GatewayError> {
    let params = envelope.params.as_object().ok_or(GatewayError::InvalidParams("params must be an object".into()))?;
    let name = params.get("name").and_then(|v| v.as_str()).ok_or(GatewayError::InvalidParams("name is required".into()))?;
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());

    if auth_header.is_none() {
        if let Some(tool) = crate::tools::find(name) {
            if tool.protected {
                return Err(GatewayError::AuthorizationRequired);
            }
        }
    }

    let session = match resolve_session(state, headers).await {
        Some(s) => s,
        None => state.sessions.create(PREFERRED_PROTOCOL_VERSION, ClientInfo { name: None, version: None }).await,
    };

    let result = crate::tools::call_tool(state, &session, name, arguments, auth_header).await?;
    Ok((result, vec![]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rejects_missing_jsonrpc_version() {
        let body = json!({ "method": "ping" });
        assert!(matches!(classify(&body), Err(GatewayError::InvalidRequest)));
    }

    #[test]
    fn classify_rejects_missing_method() {
        let body = json!({ "jsonrpc": "2.0" });
        assert!(matches!(classify(&body), Err(GatewayError::InvalidRequest)));
    }

    #[test]
    fn classify_detects_notifications_by_absent_id() {
        let body = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        let envelope = classify(&body).unwrap();
        assert!(envelope.id.is_none());
    }

    #[test]
    fn validate_headers_rejects_non_json_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse().unwrap());
        assert!(validate_headers(&headers).is_some());
    }

    #[test]
    fn validate_headers_rejects_unsupported_protocol_version() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("mcp-protocol-version", "1999-01-01".parse().unwrap());
        assert!(validate_headers(&headers).is_some());
    }
}
