//! C6: SSE Push Channel. `GET /mcp` (and its `/mcp/stream`, `/mcp/sse`
//! aliases) upgrade to a server-sent-events stream scoped to one session
//! (spec §3, §4.6).

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn frame(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {}\n\n", data)
}

fn session_id_from(headers: &HeaderMap, query: &SseQuery) -> Option<String> {
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| query.session_id.clone())
}

/// `GET /mcp` -- opens the SSE stream for a session. Re-opening the same
/// session id replaces whoever held the receiver lock before (spec §3).
pub async fn handle_get(State(state): State<AppState>, Query(query): Query<SseQuery>, headers: HeaderMap) -> Response {
    let Some(session_id) = session_id_from(&headers, &query) else {
        return (StatusCode::BAD_REQUEST, "Mcp-Session-Id header or sessionId query param is required").into_response();
    };
    let Some(session) = state.sessions.get(&session_id).await else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };

    let body = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(frame(
            "connected",
            &json!({ "session": session.id, "timestamp": crate::model::now() }),
        ));

        let mut receiver = session.lock_receiver().await;
        loop {
            match tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await {
                Ok(Some(payload)) => {
                    let event = payload.get("event").and_then(Value::as_str).unwrap_or("message");
                    yield Ok(frame(event, &payload));
                }
                Ok(None) => break,
                Err(_) => {
                    session.touch().await;
                    yield Ok(frame("heartbeat", &json!({ "timestamp": crate::model::now() })));
                }
            }
        }
    };

    let mut resp = axum::body::Body::from_stream(body).into_response();
    resp.headers_mut().insert("content-type", "text/event-stream".parse().unwrap());
    resp.headers_mut().insert("cache-control", "no-cache".parse().unwrap());
    resp.headers_mut().insert("connection", "keep-alive".parse().unwrap());
    resp.headers_mut().insert("x-accel-buffering", "no".parse().unwrap());
    resp
}

/// Kept for callers that want a plain stream handle to a session's events
/// without axum's `Body::from_stream` wrapper (used by tests).
pub fn frame_stream(events: Vec<(&'static str, Value)>) -> impl Stream<Item = String> {
    stream::iter(events.into_iter().map(|(event, data)| frame(event, &data)))
}
