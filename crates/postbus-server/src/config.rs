//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file (`postbus.toml`, `/etc/postbus/postbus.toml`,
//!   `~/.config/postbus/postbus.toml`, or an explicit path)
//! - Environment variables (`POSTBUS__PORT`, `POSTBUS__BACKEND__KIND`, ...)

use anyhow::{Context, Result};
use postbus_core::{BacklogConfig, BusConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "POSTBUS";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path the message bus routes are mounted under.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    /// Substrate configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Backlog retention.
    #[serde(default)]
    pub backlog: BacklogSettings,

    /// Long-poll configuration.
    #[serde(default)]
    pub poll: PollConfig,

    /// Listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Request headers identity is read from.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Which substrate to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process only.
    Memory,
    /// Redis, shared by every server process.
    Redis,
}

/// Substrate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Substrate kind.
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Redis key prefix.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// Backlog retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogSettings {
    /// Messages kept per channel.
    #[serde(default = "default_max_backlog_size")]
    pub max_backlog_size: usize,

    /// Messages kept in the global backlog.
    #[serde(default = "default_max_global_backlog_size")]
    pub max_global_backlog_size: usize,

    /// Seconds a backlog lives after its last append.
    #[serde(default = "default_max_backlog_age")]
    pub max_backlog_age_secs: u64,
}

/// Long-poll configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// How long a poll stays parked, in milliseconds.
    #[serde(default = "default_poll_timeout")]
    pub timeout_ms: u64,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Keepalive publish interval in milliseconds, 0 disables.
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,
}

/// Request headers identity is read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Site id header.
    #[serde(default = "default_site_header")]
    pub site_header: String,

    /// User id header.
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Comma-separated group ids header.
    #[serde(default = "default_groups_header")]
    pub groups_header: String,

    /// Admin flag header.
    #[serde(default = "default_admin_header")]
    pub admin_header: String,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_mount_path() -> String {
    "/message-bus".to_string()
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Memory
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_backlog_size() -> usize {
    1000
}

fn default_max_global_backlog_size() -> usize {
    2000
}

fn default_max_backlog_age() -> u64 {
    7 * 24 * 60 * 60 // 7 days
}

fn default_poll_timeout() -> u64 {
    25_000 // 25 seconds
}

fn default_max_body_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_keepalive_interval() -> u64 {
    60_000 // 60 seconds
}

fn default_site_header() -> String {
    "x-postbus-site".to_string()
}

fn default_user_header() -> String {
    "x-postbus-user".to_string()
}

fn default_groups_header() -> String {
    "x-postbus-groups".to_string()
}

fn default_admin_header() -> String {
    "x-postbus-admin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mount_path: default_mount_path(),
            backend: BackendConfig::default(),
            backlog: BacklogSettings::default(),
            poll: PollConfig::default(),
            listener: ListenerConfig::default(),
            identity: IdentityConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            redis_url: default_redis_url(),
            key_prefix: None,
        }
    }
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self {
            max_backlog_size: default_max_backlog_size(),
            max_global_backlog_size: default_max_global_backlog_size(),
            max_backlog_age_secs: default_max_backlog_age(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_poll_timeout(),
            max_body_size: default_max_body_size(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_interval(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            site_header: default_site_header(),
            user_header: default_user_header(),
            groups_header: default_groups_header(),
            admin_header: default_admin_header(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Uses `path` if given, otherwise the first default path that exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };
        if let Some(file) = &file {
            builder = builder.add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(path.is_some()),
            );
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the substrates cannot represent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backlog age is out of range.
    pub fn validate(&self) -> Result<()> {
        self.backlog_config()
            .validate()
            .context("Invalid backlog.max_backlog_age_secs")
    }

    fn default_path() -> Option<PathBuf> {
        let config_paths = [
            "postbus.toml",
            "/etc/postbus/postbus.toml",
            "~/.config/postbus/postbus.toml",
        ];

        config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The mount path without a trailing slash, empty for the root.
    #[must_use]
    pub fn mount_path(&self) -> &str {
        self.mount_path.trim_end_matches('/')
    }

    /// Backlog retention for the substrate.
    #[must_use]
    pub fn backlog_config(&self) -> BacklogConfig {
        BacklogConfig {
            max_backlog_size: self.backlog.max_backlog_size,
            max_global_backlog_size: self.backlog.max_global_backlog_size,
            max_backlog_age: Duration::from_secs(self.backlog.max_backlog_age_secs),
        }
    }

    /// Bus timing.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            poll_timeout: Duration::from_millis(self.poll.timeout_ms),
            keepalive_interval: Duration::from_millis(self.listener.keepalive_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.mount_path(), "/message-bus");
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.bus_config().poll_timeout, Duration::from_secs(25));
        assert_eq!(
            config.backlog_config().max_backlog_age,
            Duration::from_secs(604_800)
        );
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            mount_path = "/mb/"

            [backend]
            kind = "redis"
            key_prefix = "__test"

            [poll]
            timeout_ms = 5000

            [listener]
            keepalive_interval_ms = 0
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.mount_path(), "/mb");
        assert_eq!(config.backend.kind, BackendKind::Redis);
        assert_eq!(config.backend.key_prefix.as_deref(), Some("__test"));
        assert_eq!(config.bus_config().poll_timeout, Duration::from_secs(5));
        assert!(config.bus_config().keepalive_interval.is_zero());
        assert_eq!(config.backlog.max_backlog_size, 1000);
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("postbus-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[backlog]\nmax_backlog_size = 10\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.backlog.max_backlog_size, 10);
        assert_eq!(config.identity.site_header, "x-postbus-site");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_out_of_range_backlog_age_rejected() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.backlog.max_backlog_age_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = std::env::temp_dir().join("postbus-does-not-exist.toml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
