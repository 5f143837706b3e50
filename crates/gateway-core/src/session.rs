//! C4: Session Manager. A process-wide map of MCP session id -> session
//! record, each with an unbounded FIFO push queue (spec §4.4, §5).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::model::{now, SESSION_TTL_SECS};

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

pub struct Session {
    pub id: String,
    pub protocol_version: String,
    pub client_info: ClientInfo,
    pub created_at: i64,
    pub last_seen: RwLock<i64>,
    sender: mpsc::UnboundedSender<Value>,
    /// Guarded so that re-opening SSE on the same session id blocks until
    /// the prior consumer's stream finishes, then takes over -- "exactly
    /// one logical consumer... re-opening replaces the consumer" (spec §3).
    receiver: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl Session {
    fn new(id: String, protocol_version: String, client_info: ClientInfo) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            id,
            protocol_version,
            client_info,
            created_at: now(),
            last_seen: RwLock::new(now()),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub async fn touch(&self) {
        *self.last_seen.write().await = now();
    }

    pub async fn last_seen(&self) -> i64 {
        *self.last_seen.read().await
    }

    pub fn publish(&self, payload: Value) -> Result<(), SessionError> {
        self.sender.send(payload).map_err(|_| SessionError::NotFound)
    }

    /// Acquires exclusive consumption of this session's queue. Held for the
    /// lifetime of the SSE stream; dropped on disconnect so a reconnect can
    /// take over.
    pub async fn lock_receiver(&self) -> tokio::sync::MutexGuard<'_, mpsc::UnboundedReceiver<Value>> {
        self.receiver.lock().await
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
}

#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, protocol_version: &str, client_info: ClientInfo) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), protocol_version.to_string(), client_info));
        self.sessions.write().await.insert(id.clone(), session.clone());
        tracing::info!(target = "session", session_id = %id, "session_created");
        session
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(id).cloned();
        if let Some(ref s) = session {
            s.touch().await;
        }
        session
    }

    pub async fn publish(&self, id: &str, payload: Value) -> Result<(), SessionError> {
        let session = self.sessions.read().await.get(id).cloned().ok_or(SessionError::NotFound)?;
        session.publish(payload)
    }

    /// Evicts sessions whose `last_seen` is older than `ttl` seconds.
    pub async fn cleanup(&self, ttl: i64) {
        let cutoff = now() - ttl;
        let mut to_remove = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, session) in sessions.iter() {
                if session.last_seen().await < cutoff {
                    to_remove.push(id.clone());
                }
            }
        }
        if !to_remove.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in &to_remove {
                sessions.remove(id);
                tracing::info!(target = "session", session_id = %id, "session_evicted");
            }
        }
    }

    pub async fn cleanup_default(&self) {
        self.cleanup(SESSION_TTL_SECS).await;
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let mgr = SessionManager::new();
        let session = mgr
            .create("2025-06-18", ClientInfo { name: Some("x".into()), version: None })
            .await;
        let got = mgr.get(&session.id).await.unwrap();
        assert_eq!(got.id, session.id);
    }

    #[tokio::test]
    async fn publish_then_drain_preserves_order() {
        let mgr = SessionManager::new();
        let session = mgr.create("2025-06-18", ClientInfo { name: None, version: None }).await;
        mgr.publish(&session.id, serde_json::json!({"n": 1})).await.unwrap();
        mgr.publish(&session.id, serde_json::json!({"n": 2})).await.unwrap();
        let mut rx = session.lock_receiver().await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first["n"], 1);
        assert_eq!(second["n"], 2);
    }

    #[tokio::test]
    async fn publish_to_missing_session_is_not_found() {
        let mgr = SessionManager::new();
        let err = mgr.publish("missing", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, SessionError::NotFound);
    }

    #[tokio::test]
    async fn cleanup_evicts_only_stale_sessions() {
        let mgr = SessionManager::new();
        let session = mgr.create("2025-06-18", ClientInfo { name: None, version: None }).await;
        *session.last_seen.write().await = now() - 10_000;
        mgr.cleanup(3600).await;
        assert!(mgr.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn cleanup_keeps_fresh_sessions() {
        let mgr = SessionManager::new();
        let session = mgr.create("2025-06-18", ClientInfo { name: None, version: None }).await;
        mgr.cleanup(3600).await;
        assert!(mgr.get(&session.id).await.is_some());
    }
}
