//! Configuration parsing for the spot relay.
//!
//! The runner reads a single JSON config file. Every field except the
//! upstream credentials has a production default, and credentials can be
//! supplied through the environment instead of the file.
//!
//! # Example config
//!
//! ```json
//! {
//!   "module":   { "module_name": "spot_relay", "log_path": "/tmp/log",
//!                 "log_format": "json" },
//!   "relay":    { "listen_addr": "0.0.0.0:8080", "client_queue_capacity": 256 },
//!   "upstream": { "host": "demo.ctraderapi.com", "port": 5036,
//!                 "client_id": "...", "client_secret": "...",
//!                 "access_token": "...", "account_id": 1234567,
//!                 "directory_mode": "eager" },
//!   "reconnect": { "base_delay_ms": 1000, "max_delay_ms": 30000 }
//! }
//! ```

use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::logging::LogFormat;
use crate::types::DirectoryMode;

/// Environment variables that override upstream credentials.
pub const ENV_CLIENT_ID: &str = "CTRADER_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "CTRADER_CLIENT_SECRET";
pub const ENV_ACCESS_TOKEN: &str = "CTRADER_ACCESS_TOKEN";
pub const ENV_ACCOUNT_ID: &str = "CTRADER_ACCOUNT_ID";

/// Top-level application config, deserialized from a JSON file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Module metadata (name, log path).
    #[serde(default)]
    pub module: ModuleMeta,

    /// Client-facing listener and queue sizing.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Upstream provider endpoint, credentials and timing.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Module metadata block.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleMeta {
    pub module_name: Option<String>,
    pub log_path: Option<String>,

    /// Line format of the log file. The console is always plain text.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl AppConfig {
    /// Returns the module name used as the log file prefix.
    pub fn module_name(&self) -> String {
        self.module
            .module_name
            .clone()
            .unwrap_or_else(|| "spot_relay".to_string())
    }

    /// Returns the log path.
    pub fn log_path(&self) -> Option<String> {
        self.module.log_path.clone()
    }

    /// Override credentials from the process environment.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Override credentials from an arbitrary key lookup.
    ///
    /// Empty values are ignored so a blank variable does not wipe a value
    /// set in the file.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_CLIENT_ID) {
            self.upstream.client_id = v;
        }
        if let Some(v) = get(ENV_CLIENT_SECRET) {
            self.upstream.client_secret = v;
        }
        if let Some(v) = get(ENV_ACCESS_TOKEN) {
            self.upstream.access_token = v;
        }
        if let Some(v) = get(ENV_ACCOUNT_ID) {
            self.upstream.account_id = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_ACCOUNT_ID} is not a valid account id: {v}"))?;
        }
        Ok(())
    }

    /// Reject configs the relay cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let up = &self.upstream;
        let mut missing = Vec::new();
        if up.client_id.is_empty() {
            missing.push("client_id");
        }
        if up.client_secret.is_empty() {
            missing.push("client_secret");
        }
        if up.access_token.is_empty() {
            missing.push("access_token");
        }
        if up.account_id == 0 {
            missing.push("account_id");
        }
        if !missing.is_empty() {
            bail!("missing upstream credentials: {}", missing.join(", "));
        }
        if self.relay.client_queue_capacity == 0 || self.relay.command_queue_capacity == 0 {
            bail!("relay queue capacities must be non-zero");
        }
        if up.request_timeout_ms == 0 {
            bail!("upstream request_timeout_ms must be non-zero");
        }
        let backoff = &self.reconnect;
        if backoff.base_delay_ms == 0 || backoff.max_delay_ms < backoff.base_delay_ms {
            bail!(
                "invalid reconnect backoff: base={}ms max={}ms",
                self.reconnect.base_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Client-facing listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// WebSocket listen address.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Per-client outbound buffer; the oldest messages are dropped when full.
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    /// Capacity of the relay actor's command channel.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            client_queue_capacity: default_client_queue_capacity(),
            command_queue_capacity: default_command_queue_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// Upstream provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Provider host (e.g. `demo.ctraderapi.com`).
    #[serde(default = "default_host")]
    pub host: String,

    /// Provider port for the JSON WebSocket endpoint.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application credentials.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,

    /// Account-level token and trader account id.
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub account_id: u64,

    /// Keep-alive interval while `Ready`.
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,

    /// Bound on every request/response exchange (auth, directory,
    /// subscribe, unsubscribe).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// When symbol price scales are loaded.
    #[serde(default)]
    pub directory_mode: DirectoryMode,
}

impl UpstreamConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `wss://host:port` endpoint of the JSON protocol.
    pub fn ws_url(&self) -> String {
        format!("wss://{}:{}", self.host, self.port)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            account_id: 0,
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            request_timeout_ms: default_request_timeout_ms(),
            directory_mode: DirectoryMode::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

/// Exponential backoff for upstream reconnects.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults (used by serde)
// ---------------------------------------------------------------------------

fn default_listen_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_client_queue_capacity() -> usize {
    256
}

fn default_command_queue_capacity() -> usize {
    1024
}

fn default_host() -> String {
    "demo.ctraderapi.com".into()
}

fn default_port() -> u16 {
    5036
}

fn default_heartbeat_interval_sec() -> u64 {
    10
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Load and parse a JSON config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.upstream.client_id = "id".into();
        cfg.upstream.client_secret = "secret".into();
        cfg.upstream.access_token = "token".into();
        cfg.upstream.account_id = 42;
        cfg
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"upstream": {"client_id": "x"}}"#).unwrap();
        assert_eq!(cfg.relay.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.upstream.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(cfg.upstream.request_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(cfg.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(cfg.upstream.directory_mode, DirectoryMode::Eager);
        assert_eq!(cfg.module_name(), "spot_relay");
        assert_eq!(cfg.module.log_format, LogFormat::Text);
    }

    #[test]
    fn full_config_parses() {
        let json = r#"{
            "module": { "module_name": "fx_relay", "log_path": "/tmp/log", "log_format": "json" },
            "relay": { "listen_addr": "127.0.0.1:9000", "client_queue_capacity": 16 },
            "upstream": { "host": "live.ctraderapi.com", "port": 5036, "client_id": "a",
                          "client_secret": "b", "access_token": "c", "account_id": 7,
                          "directory_mode": "lazy" },
            "reconnect": { "base_delay_ms": 500, "max_delay_ms": 8000 }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.module_name(), "fx_relay");
        assert_eq!(cfg.log_path().as_deref(), Some("/tmp/log"));
        assert_eq!(cfg.module.log_format, LogFormat::Json);
        assert_eq!(cfg.relay.client_queue_capacity, 16);
        assert_eq!(cfg.relay.command_queue_capacity, 1024);
        assert_eq!(cfg.upstream.ws_url(), "wss://live.ctraderapi.com:5036");
        assert_eq!(cfg.upstream.directory_mode, DirectoryMode::Lazy);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn example_config_loads() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../config/relay.example.json");
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.upstream.port, 5036);
        assert_eq!(cfg.log_path(), None);
        // Credentials are left blank in the example.
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_reports_missing_credentials() {
        let err = AppConfig::default().validate().unwrap_err().to_string();
        assert!(err.contains("client_id"));
        assert!(err.contains("account_id"));
        assert!(creds().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_backoff() {
        let mut cfg = creds();
        cfg.reconnect.max_delay_ms = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_request_timeout() {
        let mut cfg = creds();
        cfg.upstream.request_timeout_ms = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("request_timeout_ms"));
    }

    #[test]
    fn env_overrides_credentials() {
        let mut cfg = AppConfig::default();
        cfg.apply_overrides_from(|key| match key {
            ENV_CLIENT_ID => Some("env-id".into()),
            ENV_CLIENT_SECRET => Some("env-secret".into()),
            ENV_ACCESS_TOKEN => Some("  ".into()),
            ENV_ACCOUNT_ID => Some("123".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.upstream.client_id, "env-id");
        assert_eq!(cfg.upstream.client_secret, "env-secret");
        assert_eq!(cfg.upstream.access_token, "");
        assert_eq!(cfg.upstream.account_id, 123);
    }

    #[test]
    fn env_override_rejects_bad_account_id() {
        let mut cfg = AppConfig::default();
        let res =
            cfg.apply_overrides_from(|key| (key == ENV_ACCOUNT_ID).then(|| "abc".to_string()));
        assert!(res.is_err());
    }
}
