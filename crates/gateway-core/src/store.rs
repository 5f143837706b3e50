//! C2: Token & Consent Store. Five keyed-by-string registries behind
//! per-map `RwLock`s (spec §4.2, §5 "shared mutable state"). TTL expiry is
//! enforced both at read time and by a background sweeper (`sweep_expired`).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::model::{
    now, AccessToken, AuthorizationCode, PendingUpstreamConsent, RefreshToken, RegisteredClient,
    TokenExtra, ACCESS_TOKEN_TTL_SECS, AUTH_CODE_TTL_SECS, PENDING_CONSENT_TTL_SECS,
    REFRESH_TOKEN_TTL_SECS,
};

#[derive(Default)]
pub struct Store {
    clients: RwLock<HashMap<String, RegisteredClient>>,
    codes: RwLock<HashMap<String, AuthorizationCode>>,
    access_tokens: RwLock<HashMap<String, AccessToken>>,
    refresh_tokens: RwLock<HashMap<String, RefreshToken>>,
    pending_consents: RwLock<HashMap<String, PendingUpstreamConsent>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- clients ----

    pub fn insert_client(&self, client: RegisteredClient) {
        self.clients
            .write()
            .unwrap()
            .insert(client.client_id.clone(), client);
    }

    pub fn get_client(&self, client_id: &str) -> Option<RegisteredClient> {
        self.clients.read().unwrap().get(client_id).cloned()
    }

    // ---- authorization codes (single-use) ----

    pub fn insert_code(&self, code: AuthorizationCode) {
        self.codes.write().unwrap().insert(code.code.clone(), code);
    }

    /// Atomically removes and returns the code iff it exists and is not expired.
    /// A second redemption of the same code therefore always misses.
    pub fn redeem_code(&self, code: &str) -> Option<AuthorizationCode> {
        let mut map = self.codes.write().unwrap();
        match map.get(code) {
            Some(c) if !c.is_expired(now()) => map.remove(code),
            Some(_) => {
                map.remove(code);
                None
            }
            None => None,
        }
    }

    pub fn peek_code(&self, code: &str) -> Option<AuthorizationCode> {
        let map = self.codes.read().unwrap();
        map.get(code)
            .filter(|c| !c.is_expired(now()))
            .cloned()
    }

    // ---- access / refresh token pairs ----

    /// Issues a fresh access/refresh pair, linked to each other, sharing `extra`.
    pub fn issue_token_pair(
        &self,
        access_token: String,
        refresh_token: String,
        client_id: String,
        scope: String,
        resource: Option<String>,
        extra: TokenExtra,
    ) -> (AccessToken, RefreshToken) {
        let issued_at = now();
        let at = AccessToken {
            access_token: access_token.clone(),
            client_id: client_id.clone(),
            scope: scope.clone(),
            resource: resource.clone(),
            issued_at,
            expires_at: issued_at + ACCESS_TOKEN_TTL_SECS,
            extra: extra.clone(),
            refresh_token: Some(refresh_token.clone()),
        };
        let rt = RefreshToken {
            refresh_token: refresh_token.clone(),
            client_id,
            scope,
            resource,
            issued_at,
            expires_at: issued_at + REFRESH_TOKEN_TTL_SECS,
            extra,
            access_token: access_token.clone(),
        };
        self.access_tokens
            .write()
            .unwrap()
            .insert(access_token, at.clone());
        self.refresh_tokens
            .write()
            .unwrap()
            .insert(refresh_token, rt.clone());
        (at, rt)
    }

    pub fn get_access_token(&self, token: &str) -> Option<AccessToken> {
        let map = self.access_tokens.read().unwrap();
        map.get(token).filter(|t| !t.is_expired(now())).cloned()
    }

    pub fn get_refresh_token(&self, token: &str) -> Option<RefreshToken> {
        let map = self.refresh_tokens.read().unwrap();
        map.get(token).filter(|t| !t.is_expired(now())).cloned()
    }

    /// Rewrites `extra` on both the access token and its paired refresh
    /// token in one critical section, preserving the §3 invariant that
    /// `access.extra == refresh.extra` at every observable moment.
    pub fn update_token_extra(&self, access_token: &str, extra: TokenExtra) -> Result<(), StoreError> {
        let mut at_map = self.access_tokens.write().unwrap();
        let at = at_map.get_mut(access_token).ok_or(StoreError::NotFound)?;
        at.extra = extra.clone();
        let refresh_token = at.refresh_token.clone();
        drop(at_map);
        if let Some(rt_key) = refresh_token {
            let mut rt_map = self.refresh_tokens.write().unwrap();
            if let Some(rt) = rt_map.get_mut(&rt_key) {
                rt.extra = extra;
            }
        }
        Ok(())
    }

    /// Rotates a refresh token: issues a new pair copying `scope`/`extra`,
    /// invalidates the old refresh token. Idempotent on the old token.
    pub fn rotate_refresh_token(
        &self,
        old_refresh_token: &str,
        new_access_token: String,
        new_refresh_token: String,
    ) -> Option<(AccessToken, RefreshToken)> {
        let old = {
            let mut map = self.refresh_tokens.write().unwrap();
            map.remove(old_refresh_token)?
        };
        // Drop the superseded access token too (best-effort; it may already be expired).
        self.access_tokens.write().unwrap().remove(&old.access_token);
        Some(self.issue_token_pair(
            new_access_token,
            new_refresh_token,
            old.client_id,
            old.scope,
            old.resource,
            old.extra,
        ))
    }

    /// Removes a token (by value) from both maps. Idempotent.
    pub fn revoke_token(&self, token: &str) {
        let rt_key = {
            let mut at_map = self.access_tokens.write().unwrap();
            at_map.remove(token).and_then(|t| t.refresh_token)
        };
        let mut rt_map = self.refresh_tokens.write().unwrap();
        if let Some(k) = rt_key {
            rt_map.remove(&k);
        }
        // `token` itself might have been a refresh token.
        if let Some(removed) = rt_map.remove(token) {
            drop(rt_map);
            self.access_tokens.write().unwrap().remove(&removed.access_token);
        }
    }

    // ---- pending upstream consent ----

    pub fn insert_pending_consent(&self, pending: PendingUpstreamConsent) {
        self.pending_consents
            .write()
            .unwrap()
            .insert(pending.upstream_state.clone(), pending);
    }

    pub fn take_pending_consent(&self, state: &str) -> Option<PendingUpstreamConsent> {
        let mut map = self.pending_consents.write().unwrap();
        match map.get(state) {
            Some(p) if !p.is_expired(now(), PENDING_CONSENT_TTL_SECS) => map.remove(state),
            Some(_) => {
                map.remove(state);
                None
            }
            None => None,
        }
    }

    /// Background sweep: evicts expired codes, tokens, and pending consents.
    /// Runs at >= 1 Hz from the owning binary (spec §4.2).
    pub fn sweep_expired(&self) {
        let n = now();
        self.codes.write().unwrap().retain(|_, c| !c.is_expired(n));
        self.access_tokens.write().unwrap().retain(|_, t| !t.is_expired(n));
        self.refresh_tokens.write().unwrap().retain(|_, t| !t.is_expired(n));
        self.pending_consents
            .write()
            .unwrap()
            .retain(|_, p| !p.is_expired(n, PENDING_CONSENT_TTL_SECS));
    }

    pub fn auth_code_ttl() -> i64 {
        AUTH_CODE_TTL_SECS
    }
}
