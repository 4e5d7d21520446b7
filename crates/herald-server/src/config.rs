//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

use herald_notify::{CaptureSettings, DispatchTimeouts, RegistryLimits};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Connection registry and broadcast settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Audit capture settings.
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "herald_notify=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Push-connection and broadcast tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Upper bound on simultaneously registered connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-connection outbound buffer, in messages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Bound on one connection's send.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Bound on a whole broadcast.
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,

    /// Silence after which a connection is reported stale.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl NotifyConfig {
    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_connections: self.max_connections,
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }

    pub fn dispatch_timeouts(&self) -> DispatchTimeouts {
        DispatchTimeouts {
            per_send: Duration::from_millis(self.send_timeout_ms),
            per_broadcast: Duration::from_millis(self.broadcast_timeout_ms),
        }
    }
}

/// What the audit middleware records.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Bodies longer than this are truncated in the record.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Header names whose values are masked in records.
    #[serde(default = "default_redact_headers")]
    pub redact_headers: Vec<String>,

    /// Request paths that are never audited.
    #[serde(default = "default_skip_paths")]
    pub skip_paths: Vec<String>,
}

impl CaptureConfig {
    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            max_body_bytes: self.max_body_bytes,
            redact_headers: self.redact_headers.clone(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8001
}

fn default_db_path() -> String {
    "herald.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_channel_capacity() -> usize {
    256
}

fn default_send_timeout_ms() -> u64 {
    2_000
}

fn default_broadcast_timeout_ms() -> u64 {
    5_000
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_redact_headers() -> Vec<String> {
    vec!["authorization".to_string(), "cookie".to_string()]
}

fn default_skip_paths() -> Vec<String> {
    vec![crate::WS_PATH.to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            channel_capacity: default_channel_capacity(),
            send_timeout_ms: default_send_timeout_ms(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            redact_headers: default_redact_headers(),
            skip_paths: default_skip_paths(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `HERALD_HOST` overrides `server.host`
/// - `HERALD_PORT` overrides `server.port`
/// - `HERALD_DB_PATH` overrides `database.path`
/// - `HERALD_LOG_LEVEL` overrides `logging.level`
/// - `HERALD_LOG_JSON` overrides `logging.json` ("true" or "1" enables)
/// - `HERALD_MAX_CONNECTIONS` overrides `notify.max_connections`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("HERALD_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("HERALD_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("HERALD_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("HERALD_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("HERALD_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(max) = std::env::var("HERALD_MAX_CONNECTIONS") {
        if let Ok(parsed) = max.parse() {
            config.notify.max_connections = parsed;
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [notify]
            max_connections = 8
            send_timeout_ms = 250

            [capture]
            redact_headers = ["x-api-key"]
            "#,
        )
        .expect("valid toml");

        assert_eq!(config.notify.max_connections, 8);
        assert_eq!(
            config.notify.dispatch_timeouts().per_send,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.notify.dispatch_timeouts().per_broadcast,
            Duration::from_millis(5_000)
        );
        assert_eq!(config.capture.settings().redact_headers, vec!["x-api-key"]);
        assert_eq!(config.capture.skip_paths, vec![crate::WS_PATH.to_string()]);
        assert_eq!(config.server.port, 8001);
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("defaults");
        assert_eq!(config.database.pool_max_size, 8);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[notify\nmax_connections = ").expect("write");
        let err = load_config(path.to_str()).expect_err("should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
