//! Configuration types for Sift
//!
//! This module defines configuration structures used across components.
//! Every field has a default so partial TOML files deserialize cleanly.

use crate::error::{Error, Result};
use crate::ider::MAX_NODE_NUMBER;
use crate::types::MAX_SHARD_NUM;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for Sift
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server identity and deployment mode
    pub server: ServerConfig,
    /// Metadata store configuration
    pub metadata: MetadataConfig,
    /// Shard worker configuration
    pub shard: ShardConfig,
    /// Write-ahead log configuration
    pub wal: WalConfig,
    /// On-disk upgrade configuration
    pub upgrade: UpgradeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the configuration, failing fast on anything that would
    /// only surface later as a runtime fault.
    pub fn validate(&self) -> Result<()> {
        if self.server.node_id > MAX_NODE_NUMBER {
            return Err(Error::configuration(format!(
                "node_id {} out of range [0, {MAX_NODE_NUMBER}]",
                self.server.node_id
            )));
        }
        if self.shard.num == 0 || self.shard.num > MAX_SHARD_NUM {
            return Err(Error::configuration(format!(
                "shard.num {} out of range [1, {MAX_SHARD_NUM}]",
                self.shard.num
            )));
        }
        if self.shard.worker_num == 0 {
            return Err(Error::configuration("shard.worker_num must be positive"));
        }
        if self.shard.queue_capacity == 0 {
            return Err(Error::configuration("shard.queue_capacity must be positive"));
        }
        if self.shard.max_batch == 0 {
            return Err(Error::configuration("shard.max_batch must be positive"));
        }
        if self.wal.sync_interval_ms == 0 {
            return Err(Error::configuration("wal.sync_interval_ms must be positive"));
        }
        if self.server.mode == ServerMode::Cluster && self.metadata.etcd.endpoints.is_empty() {
            return Err(Error::configuration(
                "cluster mode requires at least one metadata.etcd endpoint",
            ));
        }
        Ok(())
    }
}

/// Deployment mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Embedded metadata store on local disk
    #[default]
    Standalone,
    /// Shared coordination store
    Cluster,
}

impl FromStr for ServerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "standalone" | "" => Ok(Self::Standalone),
            "cluster" => Ok(Self::Cluster),
            other => Err(Error::configuration(format!("unknown server mode: {other}"))),
        }
    }
}

/// Server identity configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Deployment mode
    pub mode: ServerMode,
    /// Root directory for index data and embedded metadata
    pub data_path: PathBuf,
    /// Node number for the ID generator (0..=1023, unique per deployment)
    pub node_id: u16,
    /// Create indices on first write instead of failing with not-found
    pub auto_create_index: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::Standalone,
            data_path: PathBuf::from("./data"),
            node_id: 1,
            auto_create_index: true,
        }
    }
}

/// Embedded metadata backend selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataStorage {
    /// Transactional B-tree file (redb)
    #[default]
    Redb,
    /// Log-structured WAL + memtable + snapshots
    Lsm,
}

impl FromStr for MetadataStorage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redb" | "" => Ok(Self::Redb),
            "lsm" => Ok(Self::Lsm),
            other => Err(Error::configuration(format!(
                "unknown metadata storage: {other}"
            ))),
        }
    }
}

impl fmt::Display for MetadataStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redb => f.write_str("redb"),
            Self::Lsm => f.write_str("lsm"),
        }
    }
}

/// Metadata store configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Embedded backend used in standalone mode
    pub storage: MetadataStorage,
    /// Coordination store used in cluster mode
    pub etcd: EtcdConfig,
}

/// Coordination store (etcd v3) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// Base URLs, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,
    /// Key prefix shared by every node of the cluster
    pub prefix: String,
    /// Optional username for etcd auth
    pub username: Option<String>,
    /// Optional password for etcd auth
    pub password: Option<String>,
    /// Deadline for a single request (milliseconds)
    pub timeout_ms: u64,
    /// Deadline for establishing a connection (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            prefix: "/sift".to_string(),
            username: None,
            password: None,
            timeout_ms: 5000,
            connect_timeout_ms: 2000,
        }
    }
}

impl EtcdConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// What a writer does when a shard queue is full
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Wait for queue space
    #[default]
    Block,
    /// Fail immediately with a retryable queue-full error
    FailFast,
}

/// Shard and worker pool configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// Default number of shards for new indices
    pub num: u32,
    /// Worker units per shard; also the default delete fan-out
    pub worker_num: usize,
    /// Bounded capacity of each shard's write queue
    pub queue_capacity: usize,
    /// Behaviour when the queue is full
    pub backpressure: Backpressure,
    /// Maximum entries committed in one segment transaction
    pub max_batch: usize,
    /// Upper bound for draining a shard on close (milliseconds)
    pub close_timeout_ms: u64,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            num: 3,
            worker_num: 8,
            queue_capacity: 10_000,
            backpressure: Backpressure::Block,
            max_batch: 1000,
            close_timeout_ms: 30_000,
        }
    }
}

impl ShardConfig {
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Write-ahead log configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Periodic sync interval; bounds the crash-loss window
    pub sync_interval_ms: u64,
    /// WAL size that triggers truncation after a durable checkpoint
    pub max_size_bytes: u64,
    /// Buffer size for WAL writes
    pub write_buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 1000,
            max_size_bytes: 64 * 1024 * 1024, // 64 MB
            write_buffer_size: 64 * 1024,     // 64 KB
        }
    }
}

impl WalConfig {
    #[must_use]
    pub const fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// On-disk upgrade configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    /// On-disk versions newer than this build that are known to be readable
    pub compatible_versions: Vec<String>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
