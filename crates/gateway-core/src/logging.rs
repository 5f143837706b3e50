//! Structured RPC/event logging. Mirrors the teacher's `Event` +
//! `RpcEventPublisher` split (event shape decoupled from sink) but the only
//! sink in this gateway is `tracing` — see DESIGN.md for why the teacher's
//! DuckDB-backed sink was dropped.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Masks a secret for safe inclusion in logs or error bodies: `first4…last4`.
/// Short secrets (<= 8 chars) are fully redacted rather than partially shown.
pub fn mask_secret(secret: &str) -> String {
    let len = secret.chars().count();
    if len <= 8 {
        return "****".to_string();
    }
    let head: String = secret.chars().take(4).collect();
    let tail: String = secret.chars().skip(len - 4).collect();
    format!("{head}…{tail}")
}

#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub id: Uuid,
    pub ts_ms: i64,
    pub session_id: String,
    pub method: String,
    pub duration_ms: Option<i64>,
    pub ok: bool,
    pub error: Option<String>,
    pub request: Option<JsonValue>,
    pub response: Option<JsonValue>,
}

impl RpcEvent {
    pub fn new(method: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            session_id: session_id.into(),
            method: method.into(),
            duration_ms: None,
            ok: true,
            error: None,
            request: None,
            response: None,
        }
    }
}

// Monotonic-ish millisecond clock so events sort stably within a process.
static LAST_MS: AtomicI64 = AtomicI64::new(0);
fn now_millis() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    loop {
        let prev = LAST_MS.load(Ordering::Relaxed);
        let next = if now > prev { now } else { prev + 1 };
        if LAST_MS
            .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Records an RPC event via `tracing`. Kept as a free function (rather than a
/// trait with a single impl) since there is only one sink in this gateway.
pub fn log_rpc_event(event: RpcEvent) {
    if event.ok {
        tracing::info!(
            target = "rpc",
            id = %event.id,
            session = %event.session_id,
            method = %event.method,
            duration_ms = event.duration_ms,
            "rpc_ok"
        );
    } else {
        tracing::warn!(
            target = "rpc",
            id = %event.id,
            session = %event.session_id,
            method = %event.method,
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or("unknown"),
            "rpc_error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_long_secrets() {
        assert_eq!(mask_secret("abcdefghijklmnop"), "abcd…mnop");
    }

    #[test]
    fn masks_short_secrets_fully() {
        assert_eq!(mask_secret("abcd"), "****");
    }

    #[test]
    fn events_get_monotonic_timestamps() {
        let a = RpcEvent::new("ping", "s1");
        let b = RpcEvent::new("ping", "s1");
        assert!(b.ts_ms >= a.ts_ms);
    }
}
