//! Configuration
//!
//! Loads the orchestrator configuration from a TOML file. Every section has
//! defaults, so a minimal file only needs `state_dir`, the connections and
//! the endpoint roles:
//!
//! ```toml
//! state_dir = "/var/lib/pgshift"
//!
//! [connections.legacy]
//! dsn = "postgres://migrator@legacy-primary:5432/app"
//!
//! [connections.cluster]
//! dsn = "postgres://migrator@app-rw.db.svc:5432/app"
//!
//! [endpoints]
//! primary_write = "legacy"
//! read_only = "legacy"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterApiConfig;
use crate::coordinator::CoordinatorConfig;
use crate::failover::FailoverConfig;
use crate::hooks::HookConfig;
use crate::notify::NotificationConfig;
use crate::replication::ReplicationConfig;
use crate::snapshot::SnapshotConfig;
use crate::store::StoreConfig;
use crate::validator::ValidatorConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// The configuration parsed but is inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for job records, leases and the endpoint registry.
    pub state_dir: PathBuf,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Named database connections (source, target, and any other).
    pub connections: BTreeMap<String, ConnectionInfo>,

    /// Initial endpoint role assignments
    pub endpoints: EndpointsConfig,

    /// Backup object store
    pub store: StoreConfig,

    /// Cutover coordinator tuning
    pub coordinator: CoordinatorConfig,

    /// Snapshot exporter tuning
    pub snapshot: SnapshotConfig,

    /// Replication controller tuning
    pub replication: ReplicationConfig,

    /// Consistency validator tuning
    pub validator: ValidatorConfig,

    /// Application freeze hook
    pub hooks: HookConfig,

    /// Notification sink
    pub notifications: NotificationConfig,

    /// Target cluster management API
    pub cluster: ClusterApiConfig,

    /// Failover drill settings
    pub failover: FailoverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./pgshift-state"),
            logging: LoggingConfig::default(),
            connections: BTreeMap::new(),
            endpoints: EndpointsConfig::default(),
            store: StoreConfig::default(),
            coordinator: CoordinatorConfig::default(),
            snapshot: SnapshotConfig::default(),
            replication: ReplicationConfig::default(),
            validator: ValidatorConfig::default(),
            hooks: HookConfig::default(),
            notifications: NotificationConfig::default(),
            cluster: ClusterApiConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, info) in &self.connections {
            if info.dsn.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "connection '{name}' has an empty dsn"
                )));
            }
            if info.max_connections == 0 {
                return Err(ConfigError::Invalid(format!(
                    "connection '{name}' must allow at least one connection"
                )));
            }
        }

        if !self.endpoints.primary_write.is_empty()
            && !self.connections.contains_key(&self.endpoints.primary_write)
        {
            return Err(ConfigError::Invalid(format!(
                "endpoints.primary_write references unknown connection '{}'",
                self.endpoints.primary_write
            )));
        }
        if let Some(ref ro) = self.endpoints.read_only {
            if !self.connections.contains_key(ro) {
                return Err(ConfigError::Invalid(format!(
                    "endpoints.read_only references unknown connection '{ro}'"
                )));
            }
        }

        let c = &self.coordinator;
        if c.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.poll_interval_ms cannot be 0".to_string(),
            ));
        }
        if c.convergence_window_ms >= c.max_sync_duration_secs.saturating_mul(1000) {
            return Err(ConfigError::Invalid(
                "coordinator.convergence_window_ms must be shorter than max_sync_duration_secs"
                    .to_string(),
            ));
        }
        if self.replication.establish_attempts == 0 {
            return Err(ConfigError::Invalid(
                "replication.establish_attempts must be at least 1".to_string(),
            ));
        }
        if self.replication.slot_prefix.is_empty()
            || !self
                .replication
                .slot_prefix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ConfigError::Invalid(
                "replication.slot_prefix must be non-empty lowercase [a-z0-9_]".to_string(),
            ));
        }
        if self.snapshot.channel_depth == 0 {
            return Err(ConfigError::Invalid(
                "snapshot.channel_depth cannot be 0".to_string(),
            ));
        }
        if self.validator.sample_modulus == 0 {
            return Err(ConfigError::Invalid(
                "validator.sample_modulus cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve a connection by name.
    pub fn connection(&self, name: &str) -> Option<&ConnectionInfo> {
        self.connections.get(name)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (pretty, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format
    #[default]
    Pretty,

    /// JSON format
    Json,
}

/// Connection parameters for one named database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    /// Connection URI used by the orchestrator.
    pub dsn: String,
    /// Connection string the *target* uses to reach this database when it
    /// is the source of a subscription. Defaults to `dsn`.
    pub replication_conninfo: Option<String>,
    /// Pool size.
    pub max_connections: u32,
    /// Time allowed to acquire a pooled connection.
    pub connect_timeout_ms: u64,
    /// Server-side `statement_timeout`.
    pub statement_timeout_ms: u64,
    /// Bound on the table locks and slot creation that anchor a snapshot
    /// export. Writers on the exported tables queue behind the anchor for at
    /// most this long; an anchor that runs out is released and retried.
    pub anchor_timeout_ms: u64,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            replication_conninfo: None,
            max_connections: 4,
            connect_timeout_ms: 5_000,
            statement_timeout_ms: 60_000,
            anchor_timeout_ms: 10_000,
        }
    }
}

impl ConnectionInfo {
    /// Connection info with defaults for everything but the DSN.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Default::default()
        }
    }

    /// Connection string handed to a subscriber.
    pub fn subscriber_conninfo(&self) -> &str {
        self.replication_conninfo.as_deref().unwrap_or(&self.dsn)
    }

    /// Pool acquire timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Snapshot anchor bound.
    pub fn anchor_timeout(&self) -> Duration {
        Duration::from_millis(self.anchor_timeout_ms)
    }
}

/// Initial endpoint role assignments, by connection name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Connection serving application writes.
    pub primary_write: String,
    /// Connection serving read-only traffic.
    pub read_only: Option<String>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const SAMPLE: &str = r#"
state_dir = "/tmp/pgshift"

[logging]
level = "debug"
format = "json"

[connections.legacy]
dsn = "postgres://migrator@legacy:5432/app"

[connections.cluster]
dsn = "postgres://migrator@cluster-rw:5432/app"
replication_conninfo = "host=legacy port=5432 dbname=app user=replicator"
max_connections = 8

[endpoints]
primary_write = "legacy"
read_only = "legacy"

[coordinator]
poll_interval_ms = 500

[snapshot]
channel_depth = 4
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::parse_str(SAMPLE).unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/pgshift"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.connections.len(), 2);
        let cluster = config.connection("cluster").unwrap();
        assert_eq!(cluster.max_connections, 8);
        assert_eq!(
            cluster.subscriber_conninfo(),
            "host=legacy port=5432 dbname=app user=replicator"
        );
        assert_eq!(config.coordinator.poll_interval_ms, 500);
        assert_eq!(config.snapshot.channel_depth, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse_str("state_dir = \"/x\"").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.connections.is_empty());
        assert_eq!(config.replication.slot_prefix, "pgshift");
    }

    #[test]
    fn test_validate_rejects_unknown_endpoint() {
        let mut config = Config::parse_str(SAMPLE).unwrap();
        config.endpoints.primary_write = "nope".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_slot_prefix() {
        let mut config = Config::parse_str(SAMPLE).unwrap();
        config.replication.slot_prefix = "Bad-Prefix".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::parse_str("state_dir = ["),
            Err(ConfigError::Parse(_))
        ));
    }
}
