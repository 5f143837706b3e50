use std::collections::HashMap;
use std::env;

/// Abstracts where configuration values come from, mirroring the teacher's
/// `ConfigProvider` split between an OS-backed implementation and a
/// test-injectable one -- here the provided value is a single key-value
/// lookup rather than a settings directory, since this gateway's config is
/// entirely environment sourced (spec §6), not a settings file.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

#[derive(Default, Clone)]
pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

/// Test-time injection: an in-memory map stands in for `std::env`, so tests
/// never need to mutate (and therefore serialize around) process-wide state.
#[derive(Default, Clone)]
pub struct MapConfigSource(pub HashMap<String, String>);

impl ConfigSource for MapConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Environment-sourced configuration, read once at process startup (spec §6).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub enable_app_id: Option<String>,
    pub enable_private_key_path: Option<String>,
    pub enable_env: EnableEnv,
    pub aspsp_id: Option<String>,
    pub aspsp_country: Option<String>,
    pub oauth_redirect_url: Option<String>,
    pub oauth_issuer: Option<String>,
    pub host: String,
    pub port: u16,
    /// Overrides the Enable Banking API base URL. Unset in normal operation;
    /// exists so integration tests can point the upstream client at an
    /// in-process mock instead of `https://api.enablebanking.com`.
    pub enable_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableEnv {
    Production,
    Sandbox,
}

impl EnableEnv {
    pub fn is_production(self) -> bool {
        matches!(self, EnableEnv::Production)
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self::from_source(&EnvConfigSource)
    }

    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let enable_env = match source.get("ENABLE_ENV").as_deref() {
            Some("production") => EnableEnv::Production,
            _ => EnableEnv::Sandbox,
        };
        Self {
            enable_app_id: source.get("ENABLE_APP_ID"),
            enable_private_key_path: source.get("ENABLE_PRIVATE_KEY_PATH"),
            enable_env,
            aspsp_id: source.get("ENABLE_BANKING_ASPSP_ID"),
            aspsp_country: source.get("ENABLE_ASPSP_COUNTRY"),
            oauth_redirect_url: source.get("ENABLE_OAUTH_REDIRECT_URL"),
            oauth_issuer: source.get("OAUTH_ISSUER"),
            host: source.get("MCP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: source
                .get("MCP_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8787),
            enable_base_url: source.get("ENABLE_BASE_URL"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
