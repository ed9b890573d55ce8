use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::{
    driver::{self, rocksdb::RocksDBConfig, ConnectionOptions},
    indexes::{IndexSyncOptions, LOCK_POLL_INTERVAL},
    singleton::RetryPolicy,
};
use uuid::Uuid;

const LOCAL_ENV: &str = "local";

/// Prefix of environment variables overriding the config file, nested keys
/// separated by `__` (`SCHEMA_STATE_STORE__PATH`).
pub const ENV_PREFIX: &str = "SCHEMA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum StateStoreConfig {
    Rocksdb {
        path: String,
        #[serde(default)]
        rocksdb_config: RocksDBConfig,
    },
    Memory,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        StateStoreConfig::Rocksdb {
            path: default_state_store_path(),
            rocksdb_config: RocksDBConfig::default(),
        }
    }
}

impl StateStoreConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        match self {
            StateStoreConfig::Rocksdb {
                path,
                rocksdb_config,
            } => ConnectionOptions::RocksDB(driver::rocksdb::Options {
                path: PathBuf::from(path),
                config: rocksdb_config.clone(),
            }),
            StateStoreConfig::Memory => ConnectionOptions::InMemory,
        }
    }
}

fn default_state_store_path() -> String {
    env::current_dir()
        .unwrap_or_default()
        .join("schema_storage/state")
        .to_string_lossy()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Log index differences without creating anything.
    #[serde(default)]
    pub read_only: bool,
    #[serde(with = "duration_serde", default = "default_lock_lease")]
    pub lock_lease: Duration,
    /// Seconds to wait for the schema upgrade lock before failing. Waits
    /// indefinitely when unset.
    #[serde(default)]
    pub lock_acquire_timeout_secs: Option<u64>,
}

fn default_lock_lease() -> Duration {
    Duration::from_secs(300)
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            lock_lease: default_lock_lease(),
            lock_acquire_timeout_secs: None,
        }
    }
}

impl IndexConfig {
    pub fn sync_options(&self) -> IndexSyncOptions {
        IndexSyncOptions {
            read_only: self.read_only,
            lease: self.lock_lease,
            acquire_timeout: self.lock_acquire_timeout_secs.map(Duration::from_secs),
            poll_interval: LOCK_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingletonRetryConfig {
    /// Unbounded when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "default_min_backoff_ms")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_min_backoff_ms() -> u64 {
    1
}

fn default_max_backoff_ms() -> u64 {
    50
}

impl Default for SingletonRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            min_backoff_ms: default_min_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl SingletonRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    // Enable metrics.
    #[serde(default)]
    pub enable_metrics: bool,
    // OpenTelemetry collector grpc endpoint.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    // Metrics export interval. Defaults to 10 seconds.
    #[serde(with = "duration_serde", default = "default_metrics_interval")]
    pub metrics_interval: Duration,
    // Instance ID for this server instance.
    // Used as a metric attribute "schema.instance.id".
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_metrics_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: default_metrics_interval(),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    /// Upgrade outdated plugins during `validate`.
    #[serde(default)]
    pub auto_upgrade: bool,
    #[serde(default)]
    pub indexes: IndexConfig,
    #[serde(default)]
    pub singleton_retry: SingletonRetryConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_env() -> String {
    LOCAL_ENV.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: default_env(),
            state_store: Default::default(),
            auto_upgrade: false,
            indexes: Default::default(),
            singleton_retry: Default::default(),
            telemetry: Default::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid with the YAML file at `path` when given, overlaid
    /// with `SCHEMA_` environment variables.
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(anyhow!("config file {} does not exist", path.display()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    #[cfg(test)]
    fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        Self::extract(
            Figment::from(Serialized::defaults(ServerConfig::default()))
                .merge(Yaml::string(config_str)),
        )
    }

    fn extract(figment: Figment) -> Result<ServerConfig> {
        let config: ServerConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let StateStoreConfig::Rocksdb { path, .. } = &self.state_store {
            if path.trim().is_empty() {
                return Err(anyhow!("state_store.path must not be empty"));
            }
        }
        let retry = &self.singleton_retry;
        if retry.max_attempts == Some(0) {
            return Err(anyhow!("singleton_retry.max_attempts must be at least 1"));
        }
        if retry.min_backoff_ms > retry.max_backoff_ms {
            return Err(anyhow!(
                "singleton_retry.min_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.min_backoff_ms,
                retry.max_backoff_ms
            ));
        }
        if self.indexes.lock_lease.is_zero() {
            return Err(anyhow!("indexes.lock_lease must be positive"));
        }
        if self.telemetry.enable_metrics && self.telemetry.metrics_interval.is_zero() {
            return Err(anyhow!("telemetry.metrics_interval must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    pub fn instance_id(&self) -> String {
        self.telemetry
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }
}

// Serde module for Duration serialization/deserialization
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn should_parse_sample_config() {
        let config_yaml = include_str!("../sample_config.yaml");
        let config = ServerConfig::from_yaml_str(config_yaml).expect("unable to parse from yaml");

        assert_eq!("local", config.env);
        assert!(!config.structured_logging());
        assert_eq!(
            config.state_store,
            StateStoreConfig::Rocksdb {
                path: "/tmp/schema_storage/state".to_string(),
                rocksdb_config: RocksDBConfig {
                    max_open_files: 512,
                    lock_timeout_ms: 5_000,
                },
            }
        );
        assert!(config.auto_upgrade);
        assert_eq!(config.indexes.lock_lease, Duration::from_secs(120));
        assert_eq!(
            config.indexes.sync_options().acquire_timeout,
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.singleton_retry.policy().max_attempts, None);
        assert_eq!(
            config.singleton_retry.policy().max_backoff,
            Duration::from_millis(100)
        );
        assert_eq!(config.telemetry.metrics_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_defaults_without_file() {
        let config = ServerConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.env, "local");
        assert!(!config.auto_upgrade);
        assert!(!config.indexes.read_only);
        assert_eq!(config.singleton_retry.policy(), RetryPolicy::default());
        assert!(matches!(config.state_store, StateStoreConfig::Rocksdb { .. }));
    }

    #[test]
    fn test_memory_store() {
        let config = ServerConfig::from_yaml_str(
            r#"
env: staging
state_store:
  driver: memory
indexes:
  read_only: true
"#,
        )
        .unwrap();
        assert_eq!(config.state_store, StateStoreConfig::Memory);
        assert!(config.structured_logging());
        assert!(config.indexes.sync_options().read_only);
        assert!(config.instance_id().starts_with("staging-"));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let err = ServerConfig::from_yaml_str(
            r#"
singleton_retry:
  min_backoff_ms: 500
  max_backoff_ms: 10
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_backoff_ms"));

        assert!(ServerConfig::from_yaml_str("singleton_retry: {max_attempts: 0}").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = ServerConfig::load(Some(Path::new("/nonexistent/schema.yaml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
