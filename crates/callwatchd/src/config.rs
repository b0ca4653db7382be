//! Daemon configuration.
//!
//! Loaded from a TOML file where every field has a default, then overridden
//! from `CALLWATCH_*` environment variables. The file is looked up in this
//! order:
//!
//! 1. the path given on the command line (`--config`)
//! 2. `$CALLWATCH_CONFIG`
//! 3. `<config_dir>/callwatch/config.toml`
//!
//! A missing file at the default location is not an error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CALLWATCH_CONFIG";

/// Default Unix socket path for local subscribers.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/callwatch.sock";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {error}")]
    Read {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {error}")]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("invalid value {value:?} in {var}")]
    Env { var: String, value: String },

    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ============================================================================
// Sections
// ============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pbx: PbxConfig,
    pub cdr: CdrConfig,
    pub leads: LeadsConfig,
    pub directory: DirectoryConfig,
    pub history: HistoryConfig,
    pub server: ServerConfig,
}

/// PBX management interface connection.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PbxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    pub reconnect_delay_secs: u64,
    pub heartbeat_secs: u64,
    pub poll_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub channel_bootstrap_delay_ms: u64,
    /// Consecutive rejected logins before failures are logged as errors
    pub auth_failure_alert_threshold: u32,
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5038,
            username: String::new(),
            secret: String::new(),
            reconnect_delay_secs: 5,
            heartbeat_secs: 60,
            poll_secs: 10,
            idle_timeout_secs: 60,
            connect_timeout_secs: 10,
            channel_bootstrap_delay_ms: 2000,
            auth_failure_alert_threshold: 3,
        }
    }
}

impl fmt::Debug for PbxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PbxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("poll_secs", &self.poll_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("channel_bootstrap_delay_ms", &self.channel_bootstrap_delay_ms)
            .field("auth_failure_alert_threshold", &self.auth_failure_alert_threshold)
            .finish()
    }
}

impl PbxConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn channel_bootstrap_delay(&self) -> Duration {
        Duration::from_millis(self.channel_bootstrap_delay_ms)
    }
}

/// CDR table ingestion. Disabled when `database_url` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CdrConfig {
    pub database_url: Option<String>,
    /// Preferred table; any table whose name contains `cdr` is the fallback
    pub table: String,
    pub poll_secs: u64,
    pub bootstrap_limit: u32,
    pub poll_limit: u32,
}

impl Default for CdrConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: "cdr_pbx".to_string(),
            poll_secs: 30,
            bootstrap_limit: 500,
            poll_limit: 50,
        }
    }
}

impl CdrConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// Lead lookup. Enrichment is skipped when `database_url` is unset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeadsConfig {
    pub database_url: Option<String>,
    pub table: String,
    pub cache_ttl_secs: u64,
    pub cache_capacity: u64,
}

impl Default for LeadsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: "leads".to_string(),
            cache_ttl_secs: 30,
            cache_capacity: 10_000,
        }
    }
}

impl LeadsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Agent directory source: a TOML file or a SQL table.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub file: Option<PathBuf>,
    pub database_url: Option<String>,
    pub table: String,
    pub refresh_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            file: None,
            database_url: None,
            table: "agents".to_string(),
            refresh_secs: 60,
        }
    }
}

impl DirectoryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_records: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_records: callwatch_core::DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// Resolves, reads and validates the configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::resolve_path(explicit) {
            Some((path, required)) if required || path.exists() => Self::load_from(&path)?,
            Some((path, _)) => {
                info!(path = %path.display(), "No config file found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads one TOML file without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|error| ConfigError::Read {
            path: path.to_path_buf(),
            error,
        })?;
        toml::from_str(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    /// Returns the file to read and whether it must exist.
    fn resolve_path(explicit: Option<&Path>) -> Option<(PathBuf, bool)> {
        if let Some(path) = explicit {
            return Some((path.to_path_buf(), true));
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some((PathBuf::from(path), true));
        }
        Self::default_path().map(|p| (p, false))
    }

    /// `<config_dir>/callwatch/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("callwatch").join("config.toml"))
    }

    /// Applies `CALLWATCH_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CALLWATCH_SOCKET") {
            self.server.socket_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("CALLWATCH_PBX_HOST") {
            self.pbx.host = v;
        }
        if let Some(v) = lookup("CALLWATCH_PBX_PORT") {
            self.pbx.port = v.trim().parse().map_err(|_| ConfigError::Env {
                var: "CALLWATCH_PBX_PORT".to_string(),
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("CALLWATCH_PBX_USERNAME") {
            self.pbx.username = v;
        }
        if let Some(v) = lookup("CALLWATCH_PBX_SECRET") {
            self.pbx.secret = v;
        }
        if let Some(v) = lookup("CALLWATCH_CDR_DATABASE_URL") {
            self.cdr.database_url = Some(v);
        }
        if let Some(v) = lookup("CALLWATCH_LEADS_DATABASE_URL") {
            self.leads.database_url = Some(v);
        }
        Ok(())
    }

    /// Rejects zero intervals and a zero history capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("pbx.reconnect_delay_secs", self.pbx.reconnect_delay_secs),
            ("pbx.heartbeat_secs", self.pbx.heartbeat_secs),
            ("pbx.poll_secs", self.pbx.poll_secs),
            ("pbx.idle_timeout_secs", self.pbx.idle_timeout_secs),
            ("pbx.connect_timeout_secs", self.pbx.connect_timeout_secs),
            ("cdr.poll_secs", self.cdr.poll_secs),
            ("leads.cache_ttl_secs", self.leads.cache_ttl_secs),
            ("directory.refresh_secs", self.directory.refresh_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.history.max_records == 0 {
            return Err(ConfigError::Invalid {
                field: "history.max_records",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.pbx.port == 0 {
            return Err(ConfigError::Invalid {
                field: "pbx.port",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
