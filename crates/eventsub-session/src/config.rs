//! Session client configuration.
//!
//! Durations are written as milliseconds in configuration files:
//!
//! ```toml
//! endpoint = "wss://eventsub.wss.twitch.tv/ws"
//! keepalive_grace_factor = 1.5
//! welcome_timeout = 10000
//!
//! [reconnect]
//! initial_delay = 500
//! max_retries = 10
//!
//! [dedup]
//! enabled = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use crate::error::ConfigError;

/// Default production endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Prefix for environment overrides, e.g. `EVENTSUB_RECONNECT__MAX_RETRIES=3`
pub const DEFAULT_ENV_PREFIX: &str = "EVENTSUB";

/// Configuration for a [`SessionClient`](crate::SessionClient)
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Endpoint used for the first connection and whenever no reconnect URL applies
    pub endpoint: String,

    /// Multiplier applied to the advertised keepalive interval before the
    /// connection is declared lost
    pub keepalive_grace_factor: f64,

    /// Keepalive interval assumed when the welcome does not advertise one
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_keepalive_timeout: Duration,

    /// How long a freshly opened stream may take to deliver its welcome
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub welcome_timeout: Duration,

    /// Reconnection policy
    pub reconnect: ReconnectConfig,

    /// Notifications buffered from a migrating stream before its welcome
    pub migration_buffer_capacity: usize,

    /// Notification deduplication
    pub dedup: DedupConfig,

    /// Capacity of the reader-to-driver frame channel
    pub frame_channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            keepalive_grace_factor: 1.5,
            default_keepalive_timeout: Duration::from_secs(10),
            welcome_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            migration_buffer_capacity: 256,
            dedup: DedupConfig::default(),
            frame_channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration for the given endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the keepalive grace factor
    pub fn with_keepalive_grace_factor(mut self, factor: f64) -> Self {
        self.keepalive_grace_factor = factor;
        self
    }

    /// Set the fallback keepalive interval
    pub fn with_default_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.default_keepalive_timeout = timeout;
        self
    }

    /// Set the welcome timeout
    pub fn with_welcome_timeout(mut self, timeout: Duration) -> Self {
        self.welcome_timeout = timeout;
        self
    }

    /// Set reconnection configuration
    pub fn with_reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Set the migration buffer capacity
    pub fn with_migration_buffer_capacity(mut self, capacity: usize) -> Self {
        self.migration_buffer_capacity = capacity;
        self
    }

    /// Set deduplication configuration
    pub fn with_dedup_config(mut self, config: DedupConfig) -> Self {
        self.dedup = config;
        self
    }

    /// Set the frame channel capacity
    pub fn with_frame_channel_capacity(mut self, capacity: usize) -> Self {
        self.frame_channel_capacity = capacity;
        self
    }

    /// Time allowed between proof-of-life frames for a session that advertised
    /// `advertised` seconds (zero counts as not advertised).
    ///
    /// Saturates at [`Duration::MAX`] for intervals too large to represent.
    pub fn keepalive_deadline(&self, advertised: Option<u64>) -> Duration {
        let base = advertised
            .filter(|secs| *secs > 0)
            .map_or(self.default_keepalive_timeout, Duration::from_secs);
        Duration::try_from_secs_f64(base.as_secs_f64() * self.keepalive_grace_factor)
            .unwrap_or(Duration::MAX)
    }

    /// Load configuration from a file (TOML, YAML, or JSON)
    ///
    /// The file format is auto-detected from the file extension. Environment
    /// variables with the `EVENTSUB_` prefix override file settings, with `__`
    /// separating nested keys (`EVENTSUB_RECONNECT__MAX_RETRIES=3`).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file doesn't exist
    /// - The file format is unsupported
    /// - The file contains invalid configuration
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_prefix(path, DEFAULT_ENV_PREFIX)
    }

    /// Load configuration from a file with a custom environment prefix
    pub fn from_file_with_prefix(
        path: impl AsRef<Path>,
        env_prefix: &str,
    ) -> Result<Self, ConfigError> {
        use config::{Config, File, FileFormat};

        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let format = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => FileFormat::Toml,
            Some("yaml" | "yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => return Err(ConfigError::UnsupportedFormat),
        };

        let config = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or(ConfigError::UnsupportedFormat)?,
                format,
            ))
            .add_source(
                config::Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        eventsub_transport::validate_stream_url(&self.endpoint)
            .map_err(|e| ConfigError::invalid("endpoint", e.to_string()))?;

        if !(self.keepalive_grace_factor >= 1.0 && self.keepalive_grace_factor.is_finite()) {
            return Err(ConfigError::invalid(
                "keepalive_grace_factor",
                format!("must be a finite value of at least 1.0, got {}", self.keepalive_grace_factor),
            ));
        }
        if self.default_keepalive_timeout.is_zero() {
            return Err(ConfigError::invalid("default_keepalive_timeout", "must be non-zero"));
        }
        if self.welcome_timeout.is_zero() {
            return Err(ConfigError::invalid("welcome_timeout", "must be non-zero"));
        }
        if self.migration_buffer_capacity == 0 {
            return Err(ConfigError::invalid("migration_buffer_capacity", "must be non-zero"));
        }
        if self.frame_channel_capacity == 0 {
            return Err(ConfigError::invalid("frame_channel_capacity", "must be non-zero"));
        }

        self.reconnect.validate()?;
        self.dedup.validate()
    }
}

/// Reconnection configuration
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Enable automatic recovery after a lost connection
    pub enabled: bool,

    /// Delay before the first retry
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,

    /// Upper bound for any retry delay
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,

    /// Exponential backoff factor
    pub backoff_factor: f64,

    /// Random extra delay as a fraction of the computed delay (0.1 = up to 10%)
    pub jitter: f64,

    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.1,
            max_retries: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create new reconnection configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable automatic recovery
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Create aggressive reconnection policy
    pub fn aggressive() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            jitter: 0.1,
            max_retries: 20,
        }
    }

    /// Create conservative reconnection policy
    pub fn conservative() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.5,
            jitter: 0.1,
            max_retries: 5,
        }
    }

    /// Set whether reconnection is enabled
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set jitter ratio
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set maximum retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before connection attempt number `attempt`.
    ///
    /// Attempt 0 is the first try after a loss and goes out immediately. Later
    /// attempts back off exponentially from `initial_delay`, get up to
    /// `jitter` extra, and never exceed `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let max_secs = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent)).min(max_secs);
        let jitter = fastrand::f64() * self.jitter;
        let delay = (base * (1.0 + jitter)).min(max_secs);

        Duration::try_from_secs_f64(delay.max(0.0)).unwrap_or(self.max_delay)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(ConfigError::invalid(
                "reconnect.backoff_factor",
                format!("must be a finite value of at least 1.0, got {}", self.backoff_factor),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "reconnect.jitter",
                format!("must be between 0.0 and 1.0, got {}", self.jitter),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "reconnect.initial_delay",
                "must not exceed reconnect.max_delay",
            ));
        }
        Ok(())
    }
}

/// Notification deduplication configuration
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Drop notifications whose message id was already delivered
    pub enabled: bool,

    /// Maximum number of remembered message ids
    pub max_size: usize,

    /// How long a message id is remembered
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ttl: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 1000,
            ttl: Duration::from_secs(600),
        }
    }
}

impl DedupConfig {
    /// Enabled deduplication with default bounds
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.max_size == 0 {
            return Err(ConfigError::invalid("dedup.max_size", "must be non-zero"));
        }
        if self.enabled && self.ttl.is_zero() {
            return Err(ConfigError::invalid("dedup.ttl", "must be non-zero"));
        }
        Ok(())
    }
}
