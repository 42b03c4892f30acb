//! Daemon configuration
//!
//! ## Overview
//! - TOML config file loaded by `serve --config=<path>`
//! - `FLEETPLANE_*` environment variables override file values
//! - Durations are plain seconds; accessors return [`Duration`]

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Complete daemon configuration with deployment defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Host:port for the REST listener.
    pub bind_rest: String,
    /// Host:port for the discovery listener.
    pub bind_discovery: String,
    /// Connection string for the persistent store. `memory:` selects the
    /// embedded in-memory store.
    pub store_dsn: String,
    /// Connection string for the session/snapshot cache. Optional; loss of
    /// the cache is tolerated and rebuilt lazily.
    pub cache_dsn: Option<String>,
    /// URI of the private-key sink: `memory:` or `file:<dir>`.
    pub secret_sink: String,

    /// External license validation service. When unset the gate serves the
    /// built-in community verdict.
    pub license_endpoint: Option<String>,
    pub license_timeout_secs: u64,
    pub license_cache_ttl_secs: u64,
    pub license_grace_secs: u64,

    /// Server TLS material for REST and discovery listeners.
    pub tls_listener_cert: Option<String>,
    pub tls_listener_key: Option<String>,

    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,

    /// Failed-login lockout.
    pub lockout_threshold: u32,
    pub lockout_window_secs: u64,

    /// Discovery and proxy liveness.
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_threshold: u32,

    /// CA and cluster-key rotation overlap.
    pub rotation_overlap_secs: u64,

    pub log_level: String,
    /// `text` or `json`.
    pub log_format: String,

    /// Resource bounds; exceeding them yields explicit overload errors.
    pub max_connections: usize,
    pub max_streams_per_cluster: usize,
    pub max_snapshot_resources: usize,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,

    /// Per-endpoint token-bucket rate limit.
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,

    /// Login for the bootstrap administrator created on an empty store.
    pub initial_admin_login: String,
    pub initial_admin_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_rest: "127.0.0.1:8080".to_string(),
            bind_discovery: "127.0.0.1:9090".to_string(),
            store_dsn: "memory:".to_string(),
            cache_dsn: None,
            secret_sink: "memory:".to_string(),
            license_endpoint: None,
            license_timeout_secs: 10,
            license_cache_ttl_secs: 3600,
            license_grace_secs: 86_400,
            tls_listener_cert: None,
            tls_listener_key: None,
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 7 * 86_400,
            lockout_threshold: 5,
            lockout_window_secs: 300,
            heartbeat_interval_secs: 30,
            heartbeat_miss_threshold: 3,
            rotation_overlap_secs: 60 * 86_400,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            max_connections: 1024,
            max_streams_per_cluster: 64,
            max_snapshot_resources: 10_000,
            max_body_bytes: 1 << 20,
            request_timeout_secs: 30,
            rate_limit_per_sec: 50,
            rate_limit_burst: 100,
            initial_admin_login: "admin".to_string(),
            initial_admin_password: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ControlError::validation(format!("cannot read config: {e}")))?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|e| ControlError::validation(format!("invalid config: {e}")))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides; used when no file is given.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        use std::env;

        let mut set_str = |key: &str, slot: &mut String| {
            if let Ok(v) = env::var(key) {
                *slot = v;
            }
        };
        set_str("FLEETPLANE_BIND_REST", &mut self.bind_rest);
        set_str("FLEETPLANE_BIND_DISCOVERY", &mut self.bind_discovery);
        set_str("FLEETPLANE_STORE_DSN", &mut self.store_dsn);
        set_str("FLEETPLANE_SECRET_SINK", &mut self.secret_sink);
        set_str("FLEETPLANE_LOG_LEVEL", &mut self.log_level);
        set_str("FLEETPLANE_LOG_FORMAT", &mut self.log_format);

        if let Ok(v) = env::var("FLEETPLANE_LICENSE_ENDPOINT") {
            self.license_endpoint = Some(v);
        }
        if let Ok(v) = env::var("FLEETPLANE_ADMIN_PASSWORD") {
            self.initial_admin_password = Some(v);
        }

        let mut set_u64 = |key: &str, slot: &mut u64| {
            if let Ok(parsed) = env::var(key).map(|v| v.parse()) {
                if let Ok(parsed) = parsed {
                    *slot = parsed;
                }
            }
        };
        set_u64("FLEETPLANE_LICENSE_TIMEOUT_SECS", &mut self.license_timeout_secs);
        set_u64("FLEETPLANE_LICENSE_CACHE_TTL_SECS", &mut self.license_cache_ttl_secs);
        set_u64("FLEETPLANE_LICENSE_GRACE_SECS", &mut self.license_grace_secs);
        set_u64("FLEETPLANE_ACCESS_TOKEN_TTL_SECS", &mut self.access_token_ttl_secs);
        set_u64("FLEETPLANE_REFRESH_TOKEN_TTL_SECS", &mut self.refresh_token_ttl_secs);
        set_u64("FLEETPLANE_ROTATION_OVERLAP_SECS", &mut self.rotation_overlap_secs);
    }

    fn validate(&self) -> Result<()> {
        if self.log_format != "text" && self.log_format != "json" {
            return Err(ControlError::invalid_field(
                "log_format",
                "must be `text` or `json`",
            ));
        }
        if let Some(endpoint) = &self.license_endpoint {
            url::Url::parse(endpoint).map_err(|e| {
                ControlError::invalid_field("license_endpoint", format!("invalid URL: {e}"))
            })?;
        }
        if self.tls_listener_cert.is_some() != self.tls_listener_key.is_some() {
            return Err(ControlError::validation(
                "tls_listener_cert and tls_listener_key must be set together",
            ));
        }
        if self.lockout_threshold == 0 {
            return Err(ControlError::invalid_field(
                "lockout_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn license_timeout(&self) -> Duration {
        Duration::from_secs(self.license_timeout_secs)
    }

    pub fn license_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.license_cache_ttl_secs)
    }

    pub fn license_grace(&self) -> Duration {
        Duration::from_secs(self.license_grace_secs)
    }

    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }

    pub fn lockout_window(&self) -> Duration {
        Duration::from_secs(self.lockout_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn rotation_overlap(&self) -> Duration {
        Duration::from_secs(self.rotation_overlap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
