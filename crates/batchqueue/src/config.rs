//! Configuration for storage selection, queue routing and runtime defaults.
//!
//! The configuration is an explicit value handed to [`BatchManager`] at
//! construction rather than a process-wide singleton. It can be built in
//! code, loaded from a file, or overridden through `BATCHQUEUE__`-prefixed
//! environment variables (`BATCHQUEUE__REDIS__HOST=cache-1` etc).
//!
//! [`BatchManager`]: crate::manager::BatchManager

use crate::error::{BatchQueueError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Hard default queue for parallel batches
pub const DEFAULT_PARALLEL_QUEUE: &str = "batchjob";

/// Hard default queue for sequential chains
pub const DEFAULT_SEQUENTIAL_QUEUE: &str = "chainedjobs";

/// Which storage backend holds batch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Transactional SQL store (sqlx)
    Sql,
    /// Redis hash-based store
    Redis,
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::Sql
    }
}

/// Which processor variant consumes a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    /// [`ParallelProcessor`](crate::processor::ParallelProcessor)
    Parallel,
    /// [`ChainProcessor`](crate::processor::ChainProcessor)
    Sequential,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchQueueConfig {
    /// Storage backend selection
    pub storage: StorageKind,
    /// SQL backend settings
    pub sql: SqlConfig,
    /// Redis backend settings
    pub redis: RedisConfig,
    /// Default queue selection
    pub queue: QueueSettings,
    /// Runtime defaults applied to every batch
    pub defaults: DefaultsConfig,
    /// Periodic cleanup of terminal batches
    pub cleanup: CleanupConfig,
    /// Queue routing table
    pub queues: QueuesConfig,
}

/// SQL backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SqlConfig {
    /// sqlx connection string
    pub connection: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            connection: "sqlite::memory:".to_string(),
        }
    }
}

/// Redis backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Logical database index
    pub database: i64,
    /// Optional password
    pub password: Option<String>,
    /// Keep the connection alive between operations
    pub persistent: bool,
    /// Connect timeout in seconds
    pub timeout: u64,
    /// Read timeout in seconds
    pub read_timeout: u64,
    /// Key namespace prefix
    pub prefix: String,
    /// Time-to-live for batch keys in seconds, renewed on each write
    pub ttl: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            persistent: true,
            timeout: 5,
            read_timeout: 5,
            prefix: "batch:".to_string(),
            ttl: 86_400,
        }
    }
}

impl RedisConfig {
    /// Render the settings as a `redis://` connection URL
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Default queue selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSettings {
    /// Logical queue name applied to batches that do not pick one
    pub name: Option<String>,
}

/// Runtime defaults applied to every batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Fire the failure callback on the first failing job of a parallel batch
    pub fail_on_first_error: bool,
    /// Per-message retry budget handed to the queue transport
    pub max_retries: u32,
    /// Timeout hint in seconds, consumed by external monitoring only
    pub timeout: Option<u64>,
    /// Keep the first terminal status of a batch; never downgrade `failed`
    /// back to `completed` when stragglers succeed after a failure
    pub sticky_terminal: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            fail_on_first_error: false,
            max_retries: 0,
            timeout: None,
            sticky_terminal: true,
        }
    }
}

/// Periodic cleanup of terminal batches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleanupConfig {
    /// Enable the background sweep
    pub enabled: bool,
    /// Remove completed/failed batches older than this many days
    pub older_than_days: i64,
    /// Seconds between sweeps
    pub run_interval: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            older_than_days: 30,
            run_interval: 3_600,
        }
    }
}

/// Queue routing table
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueuesConfig {
    /// Per-type queue overrides
    pub default: DefaultQueues,
    /// Named queue entries, keyed by the logical `queue_name`
    pub named: HashMap<String, NamedQueueConfig>,
    /// Per-type entries carrying a processor assignment
    pub types: HashMap<String, NamedQueueConfig>,
}

/// Per-type queue overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultQueues {
    /// Override for parallel batches
    pub parallel: Option<String>,
    /// Override for sequential chains
    pub sequential: Option<String>,
}

/// A named or per-type queue entry
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NamedQueueConfig {
    /// Concrete queue name used when enqueuing
    pub queue_config: Option<String>,
    /// Processor variant consuming this queue
    pub processor: Option<ProcessorKind>,
}

impl BatchQueueConfig {
    /// Load configuration from a file, applying environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("BATCHQUEUE").separator("__"))
            .build()
            .map_err(|e| BatchQueueError::InvalidConfiguration(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| BatchQueueError::InvalidConfiguration(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Load configuration from environment overrides alone
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("BATCHQUEUE").separator("__"))
            .build()
            .map_err(|e| BatchQueueError::InvalidConfiguration(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| BatchQueueError::InvalidConfiguration(e.to_string()))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sql.connection.is_empty() {
            return Err(BatchQueueError::InvalidConfiguration(
                "sql.connection must not be empty".to_string(),
            ));
        }

        if self.redis.host.is_empty() {
            return Err(BatchQueueError::InvalidConfiguration(
                "redis.host must not be empty".to_string(),
            ));
        }

        if self.redis.ttl == 0 {
            return Err(BatchQueueError::InvalidConfiguration(
                "redis.ttl must be positive".to_string(),
            ));
        }

        if self.cleanup.older_than_days < 0 {
            return Err(BatchQueueError::InvalidConfiguration(
                "cleanup.older_than_days must not be negative".to_string(),
            ));
        }

        if self.cleanup.enabled && self.cleanup.run_interval == 0 {
            return Err(BatchQueueError::InvalidConfiguration(
                "cleanup.run_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BatchQueueConfig::default();
        assert_eq!(config.storage, StorageKind::Sql);
        assert_eq!(config.sql.connection, "sqlite::memory:");
        assert_eq!(config.redis.prefix, "batch:");
        assert_eq!(config.redis.ttl, 86_400);
        assert!(config.defaults.sticky_terminal);
        assert!(!config.defaults.fail_on_first_error);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://127.0.0.1:6379/0");

        redis.password = Some("secret".to_string());
        redis.database = 2;
        assert_eq!(redis.url(), "redis://:secret@127.0.0.1:6379/2");
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        let mut config = BatchQueueConfig::default();
        config.redis.ttl = 0;
        assert!(matches!(
            config.validate(),
            Err(BatchQueueError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_deserialize_routing_table() {
        let raw = serde_json::json!({
            "storage": "redis",
            "queues": {
                "default": { "parallel": "fast-lane" },
                "named": {
                    "reports": { "queue_config": "reporting", "processor": "sequential" }
                }
            }
        });

        let config: BatchQueueConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.storage, StorageKind::Redis);
        assert_eq!(config.queues.default.parallel.as_deref(), Some("fast-lane"));
        let named = config.queues.named.get("reports").unwrap();
        assert_eq!(named.queue_config.as_deref(), Some("reporting"));
        assert_eq!(named.processor, Some(ProcessorKind::Sequential));
    }
}
