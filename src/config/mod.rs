//! Event store configuration.
//!
//! Loaded from YAML files or environment variables. Every struct is
//! `#[serde(default)]`, so any subset of fields may be given.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::backend::GroupStart;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "event-store.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENT_STORE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENT_STORE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENT_STORE_LOG";

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Backing store type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Memory,
    Redis,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL (e.g., redis://localhost:6379).
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    pub redis: RedisConfig,
}

/// What a consumer does with an entry whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Leave the entry pending; it is redelivered once it has been idle for
    /// `claim_idle_timeout`, until `max_deliveries` is reached. Handlers
    /// must be idempotent.
    #[default]
    Retry,
    /// Acknowledge the entry anyway. The failure is logged and the entry is
    /// not delivered to this group again.
    Acknowledge,
}

/// Event store and consumer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    pub backend: BackendConfig,
    /// Prefix of every stream key. On Redis Cluster it must contain a hash
    /// tag such as `{events}:` so appends stay within one slot.
    pub stream_prefix: String,
    /// Name of the global log, appended to `stream_prefix`.
    pub all_events_stream: String,
    pub consumer_group: String,
    /// This consumer's identity within its group.
    pub consumer_name: String,
    /// Idle time after which another consumer may claim a pending entry.
    pub claim_idle_timeout_ms: u64,
    /// Longest a poll waits for new entries.
    pub poll_timeout_ms: u64,
    /// Most entries handled per poll.
    pub max_batch_size: usize,
    /// Deadline for a single backing store call.
    pub operation_timeout_ms: u64,
    pub create_consumer_group_if_not_exists: bool,
    pub group_start: GroupStart,
    pub handler_failure: FailurePolicy,
    /// Deliveries after which a failing entry is acknowledged under the
    /// `retry` policy. 0 retries forever.
    pub max_deliveries: u32,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            stream_prefix: "event-stream:".to_string(),
            all_events_stream: "all-events".to_string(),
            consumer_group: "event-processors".to_string(),
            consumer_name: "event-consumer".to_string(),
            claim_idle_timeout_ms: 60_000,
            poll_timeout_ms: 100,
            max_batch_size: 100,
            operation_timeout_ms: 2_000,
            create_consumer_group_if_not_exists: true,
            group_start: GroupStart::default(),
            handler_failure: FailurePolicy::default(),
            max_deliveries: 5,
        }
    }
}

impl EventStoreConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `event-store.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: EventStoreConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no store or consumer could run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });

        if self.all_events_stream.is_empty() {
            return invalid("all_events_stream", "must not be empty");
        }
        if self.consumer_group.is_empty() {
            return invalid("consumer_group", "must not be empty");
        }
        if self.consumer_name.is_empty() {
            return invalid("consumer_name", "must not be empty");
        }
        if self.max_batch_size == 0 {
            return invalid("max_batch_size", "must be at least 1");
        }
        if self.operation_timeout_ms == 0 {
            return invalid("operation_timeout_ms", "must be at least 1");
        }
        if self.backend.backend_type == BackendType::Redis && self.backend.redis.url.is_empty() {
            return invalid("backend.redis.url", "must not be empty");
        }
        Ok(())
    }

    /// Key of an aggregate's stream.
    pub fn stream_key(&self, aggregate_id: Uuid) -> String {
        format!("{}{}", self.stream_prefix, aggregate_id)
    }

    /// Key of the global log.
    pub fn all_events_key(&self) -> String {
        format!("{}{}", self.stream_prefix, self.all_events_stream)
    }

    pub fn claim_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_idle_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
