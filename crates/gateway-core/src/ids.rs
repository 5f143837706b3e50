use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;

/// Generates an opaque, URL-safe token with at least 256 bits of entropy.
///
/// Used for access tokens, refresh tokens, authorization codes, and the
/// upstream-consent correlator (`upstream_state`) — every identifier spec §3
/// marks *(secret)*.
pub fn opaque_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generates a client id. Not secret, but still unguessable enough to avoid collisions.
pub fn client_id() -> String {
    format!("client_{}", uuid::Uuid::new_v4().simple())
}

/// Generates a client secret for confidential clients.
pub fn client_secret() -> String {
    opaque_token()
}
