//! Configuration loading for syncproxy.
//!
//! Configuration is loaded from a TOML file (default: `syncproxy.toml`), then
//! environment variables (`LISTEN_ADDRESS`, `HOMESERVER_URL`, `SHARED_SECRET`,
//! ...) are applied on top for container deployments.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for syncproxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Control API configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream homeserver configuration.
    #[serde(default)]
    pub homeserver: HomeserverConfig,
    /// Target store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Downstream delivery configuration.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Long-poll loop configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Retry backoff shared by the sync loop and delivery.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:29331).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Bearer secret required on every control request.
    #[serde(default)]
    pub shared_secret: String,
}

/// Upstream homeserver configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HomeserverConfig {
    /// Base URL of the homeserver client-server API.
    #[serde(default)]
    pub url: String,
}

/// Target store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Downstream delivery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Treat a response without synchronous confirmation as a failure.
    #[serde(default)]
    pub expect_synchronous: bool,
    /// Timeout for a single delivery attempt in seconds (default: 60).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Long-poll loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Server-side wait budget for each /sync call in milliseconds (default: 30000).
    #[serde(default = "default_sync_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a DELETE waits for the loop to stop, in seconds (default: 30).
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// First retry delay in milliseconds (default: 2000).
    #[serde(default = "default_retry_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound for the retry delay in milliseconds (default: 120000).
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Log at debug level.
    #[serde(default)]
    pub debug: bool,
    /// Explicit `tracing_subscriber::EnvFilter` directive; overrides `debug`.
    #[serde(default)]
    pub filter: Option<String>,
}

// Default value functions
fn default_listen_address() -> String {
    "0.0.0.0:29331".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("syncproxy.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_stop_timeout_secs() -> u64 {
    30
}

fn default_retry_initial_ms() -> u64 {
    2_000
}

fn default_retry_max_ms() -> u64 {
    120_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            shared_secret: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            expect_synchronous: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sync_timeout_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_retry_initial_ms(),
            max_ms: default_retry_max_ms(),
        }
    }
}

impl SyncConfig {
    /// Long-poll budget as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Stop-join bound as a duration.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load from `path` if it exists, otherwise start from defaults, then
    /// apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// Boolean flags are enabled by any non-empty value. Unparsable numbers
    /// keep the current value.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LISTEN_ADDRESS") {
            self.server.listen_address = v;
        }
        if let Some(v) = lookup("SHARED_SECRET") {
            self.server.shared_secret = v;
        }
        if let Some(v) = lookup("HOMESERVER_URL") {
            self.homeserver.url = v;
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.storage.database = PathBuf::from(v);
        }
        if let Some(n) = lookup("DATABASE_MAX_OPEN_CONNS").and_then(|v| v.parse().ok()) {
            self.storage.max_connections = n;
        }
        if lookup("EXPECT_SYNCHRONOUS").is_some_and(|v| !v.is_empty()) {
            self.delivery.expect_synchronous = true;
        }
        if lookup("DEBUG").is_some_and(|v| !v.is_empty()) {
            self.logging.debug = true;
        }
    }

    /// Check that required settings are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.homeserver.url.is_empty() {
            return Err(ConfigError::Missing("homeserver.url (HOMESERVER_URL)"));
        }
        if let Err(e) = url::Url::parse(&self.homeserver.url) {
            return Err(ConfigError::Invalid {
                field: "homeserver.url",
                reason: e.to_string(),
            });
        }
        if self.server.shared_secret.is_empty() {
            return Err(ConfigError::Missing("server.shared_secret (SHARED_SECRET)"));
        }
        if self.storage.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "storage.max_connections",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// The tracing filter directive to use when `RUST_LOG` is unset.
    pub fn log_directive(&self) -> String {
        match &self.logging.filter {
            Some(filter) => filter.clone(),
            None if self.logging.debug => "debug".to_string(),
            None => "info".to_string(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A required setting is missing.
    #[error("missing required setting {0}")]
    Missing(&'static str),
    /// A setting has an unusable value.
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        /// Setting name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
