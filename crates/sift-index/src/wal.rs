//! Per-shard write-ahead log
//!
//! Every document operation is logged before it is queued for a worker.
//! The record LSN is the operation's sequence number, so log order is the
//! order in which the segment applies operations.

use crate::error::{IndexError, Result};
use crate::meta::now_ms;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sift_common::config::WalConfig;
use sift_common::{RecordLog, RecordLogConfig};
use std::path::Path;

/// Log file name inside a shard directory
pub const WAL_FILE: &str = "wal.log";

/// Record magic for shard logs
const SHARD_WAL_MAGIC: u32 = 0x5357_414C; // "SWAL"

/// Document operation kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocOp {
    Put,
    Delete,
}

/// One logged document operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Sequence number; carried by the record header, not the body
    #[serde(skip)]
    pub seq: u64,
    pub op: DocOp,
    pub doc_id: String,
    /// JSON source for puts, empty for deletes
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl WalEntry {
    /// New put entry; the sequence is assigned at append time
    #[must_use]
    pub fn put(doc_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            seq: 0,
            op: DocOp::Put,
            doc_id: doc_id.into(),
            payload,
            timestamp: now_ms(),
        }
    }

    /// New delete entry; the sequence is assigned at append time
    #[must_use]
    pub fn delete(doc_id: impl Into<String>) -> Self {
        Self {
            seq: 0,
            op: DocOp::Delete,
            doc_id: doc_id.into(),
            payload: Bytes::new(),
            timestamp: now_ms(),
        }
    }
}

/// Shard write-ahead log
pub struct ShardWal {
    log: RecordLog,
}

impl ShardWal {
    /// Open (or create) the log in `shard_dir`
    pub fn open(shard_dir: &Path, config: &WalConfig) -> Result<Self> {
        let log_config = RecordLogConfig {
            // Durability comes from the periodic sync tick
            sync_on_write: false,
            max_size_bytes: config.max_size_bytes,
            write_buffer_size: config.write_buffer_size,
        };
        let log = RecordLog::open(shard_dir.join(WAL_FILE), SHARD_WAL_MAGIC, log_config)
            .map_err(IndexError::Wal)?;
        Ok(Self { log })
    }

    /// Log `entry`, then run `then` with the stamped entry while still
    /// holding the log lock, so hand-off order matches sequence order.
    pub fn append_then<T>(&self, entry: &WalEntry, then: impl FnOnce(WalEntry) -> T) -> Result<T> {
        let body = bincode::serialize(entry)?;
        self.log
            .append_then(&body, |seq| {
                let mut stamped = entry.clone();
                stamped.seq = seq;
                then(stamped)
            })
            .map_err(IndexError::Wal)
    }

    /// Log `entry` and return its sequence number
    pub fn append(&self, entry: &WalEntry) -> Result<u64> {
        self.append_then(entry, |stamped| stamped.seq)
    }

    /// Replay entries with sequence greater than `after`, in order
    pub fn replay_after<F>(&self, after: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(WalEntry) -> Result<()>,
    {
        let mut failure = None;
        let last = self
            .log
            .replay(after + 1, |seq, data| {
                if failure.is_some() {
                    return Ok(());
                }
                let outcome = bincode::deserialize::<WalEntry>(data)
                    .map_err(IndexError::from)
                    .and_then(|mut entry| {
                        entry.seq = seq;
                        callback(entry)
                    });
                if let Err(e) = outcome {
                    failure = Some(e);
                }
                Ok(())
            })
            .map_err(IndexError::Wal)?;
        failure.map_or(Ok(last), Err)
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain<F>(&self, mut keep: F) -> Result<u64>
    where
        F: FnMut(&WalEntry) -> bool,
    {
        self.log
            .retain(|seq, data| match bincode::deserialize::<WalEntry>(data) {
                Ok(mut entry) => {
                    entry.seq = seq;
                    keep(&entry)
                }
                // Unreadable bodies are kept for inspection
                Err(_) => true,
            })
            .map_err(IndexError::Wal)
    }

    /// Flush and fsync; returns the highest durable sequence
    pub fn sync(&self) -> Result<u64> {
        self.log.sync().map_err(IndexError::Wal)
    }

    /// Drop entries with sequence below `seq`
    pub fn truncate_before(&self, seq: u64) -> Result<()> {
        self.log.truncate_before(seq).map_err(IndexError::Wal)
    }

    /// Continue numbering after a checkpointed sequence
    pub fn advance_to(&self, seq: u64) {
        self.log.advance_to(seq);
    }

    /// Last assigned sequence
    #[must_use]
    pub fn current_seq(&self) -> u64 {
        self.log.current_lsn()
    }

    /// Log size in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.log.size()
    }

    /// Whether the log has outgrown its configured limit
    #[must_use]
    pub fn needs_truncate(&self) -> bool {
        self.log.needs_compaction()
    }
}
