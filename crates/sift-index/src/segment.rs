//! Segment storage: the committed, readable state of one shard.
//!
//! Batches are committed cheaply (not fsynced); `checkpoint` makes
//! everything committed so far durable and reports the sequence it covers.
//! After a crash a segment reopens at its last checkpoint and the shard
//! replays the WAL from there.

use crate::error::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use redb::{Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Segment file name inside a shard directory
pub const SEGMENT_FILE: &str = "segment.redb";

const DOCS: TableDefinition<&str, &[u8]> = TableDefinition::new("docs");
const STATE: TableDefinition<&str, u64> = TableDefinition::new("state");
const APPLIED_SEQ: &str = "applied_seq";

/// A WAL entry after worker preparation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreparedOp {
    /// Store `source` under `doc_id`
    Put { doc_id: String, source: Bytes },
    /// Remove `doc_id`
    Delete { doc_id: String },
    /// Entry rejected during preparation; only advances the sequence
    Skip,
}

/// Storage behind a shard
pub trait SegmentStore: Send + Sync {
    /// Commit a batch in order and record `last_seq` as applied
    fn apply(&self, batch: &[PreparedOp], last_seq: u64) -> Result<()>;

    /// Committed source of a document
    fn get(&self, doc_id: &str) -> Result<Option<Bytes>>;

    /// Whether a document is committed
    fn contains(&self, doc_id: &str) -> Result<bool> {
        Ok(self.get(doc_id)?.is_some())
    }

    /// Number of committed documents
    fn doc_count(&self) -> u64;

    /// Highest sequence committed (durable or not)
    fn applied_seq(&self) -> u64;

    /// Make committed state durable; returns the sequence it covers.
    /// Stores that cannot persist return 0.
    fn checkpoint(&self) -> Result<u64>;

    /// Approximate on-disk or in-memory footprint
    fn size_bytes(&self) -> u64;
}

/// Segment in a redb file
pub struct RedbSegment {
    path: PathBuf,
    db: Database,
    doc_count: AtomicU64,
    applied_seq: AtomicU64,
    /// Serializes writers so counters match committed state
    write_lock: parking_lot::Mutex<()>,
}

impl RedbSegment {
    /// Open (or create) the segment in `shard_dir`
    pub fn open(shard_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(shard_dir)?;
        let path = shard_dir.join(SEGMENT_FILE);
        let db = Database::create(&path).map_err(redb::Error::from)?;

        let write_txn = db.begin_write().map_err(redb::Error::from)?;
        {
            write_txn.open_table(DOCS).map_err(redb::Error::from)?;
            write_txn.open_table(STATE).map_err(redb::Error::from)?;
        }
        write_txn.commit().map_err(redb::Error::from)?;

        let (doc_count, applied_seq) = {
            let read_txn = db.begin_read().map_err(redb::Error::from)?;
            let docs = read_txn.open_table(DOCS).map_err(redb::Error::from)?;
            let state = read_txn.open_table(STATE).map_err(redb::Error::from)?;
            let applied = state
                .get(APPLIED_SEQ)
                .map_err(redb::Error::from)?
                .map_or(0, |v| v.value());
            (docs.len().map_err(redb::Error::from)?, applied)
        };

        debug!(
            "Opened segment {:?}: docs={}, applied_seq={}",
            path, doc_count, applied_seq
        );
        Ok(Self {
            path,
            db,
            doc_count: AtomicU64::new(doc_count),
            applied_seq: AtomicU64::new(applied_seq),
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    /// Every committed document, in id order
    pub fn documents(&self) -> Result<Vec<(String, Bytes)>> {
        let read_txn = self.db.begin_read().map_err(redb::Error::from)?;
        let docs = read_txn.open_table(DOCS).map_err(redb::Error::from)?;
        let mut out = Vec::new();
        for entry in docs.iter().map_err(redb::Error::from)? {
            let (k, v) = entry.map_err(redb::Error::from)?;
            out.push((k.value().to_string(), Bytes::copy_from_slice(v.value())));
        }
        Ok(out)
    }

    /// Durably write documents without touching the applied sequence.
    /// Used when moving documents between shards.
    pub fn import(&self, docs: &[(String, Bytes)]) -> Result<()> {
        let ops: Vec<PreparedOp> = docs
            .iter()
            .map(|(doc_id, source)| PreparedOp::Put {
                doc_id: doc_id.clone(),
                source: source.clone(),
            })
            .collect();
        self.write(&ops, None, Durability::Immediate)
    }

    /// Durably remove documents without touching the applied sequence
    pub fn purge(&self, doc_ids: &[String]) -> Result<()> {
        let ops: Vec<PreparedOp> = doc_ids
            .iter()
            .map(|doc_id| PreparedOp::Delete {
                doc_id: doc_id.clone(),
            })
            .collect();
        self.write(&ops, None, Durability::Immediate)
    }

    fn write(&self, ops: &[PreparedOp], seq: Option<u64>, durability: Durability) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut write_txn = self.db.begin_write().map_err(redb::Error::from)?;
        write_txn.set_durability(durability);

        let mut added = 0u64;
        let mut removed = 0u64;
        {
            let mut docs = write_txn.open_table(DOCS).map_err(redb::Error::from)?;
            for op in ops {
                match op {
                    PreparedOp::Put { doc_id, source } => {
                        let existed = docs
                            .insert(doc_id.as_str(), source.as_ref())
                            .map_err(redb::Error::from)?
                            .is_some();
                        if !existed {
                            added += 1;
                        }
                    }
                    PreparedOp::Delete { doc_id } => {
                        let existed = docs
                            .remove(doc_id.as_str())
                            .map_err(redb::Error::from)?
                            .is_some();
                        if existed {
                            removed += 1;
                        }
                    }
                    PreparedOp::Skip => {}
                }
            }
            if let Some(seq) = seq {
                let mut state = write_txn.open_table(STATE).map_err(redb::Error::from)?;
                state.insert(APPLIED_SEQ, seq).map_err(redb::Error::from)?;
            }
        }
        write_txn.commit().map_err(redb::Error::from)?;

        self.doc_count.fetch_add(added, Ordering::SeqCst);
        self.doc_count.fetch_sub(removed, Ordering::SeqCst);
        if let Some(seq) = seq {
            self.applied_seq.fetch_max(seq, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Segment file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SegmentStore for RedbSegment {
    fn apply(&self, batch: &[PreparedOp], last_seq: u64) -> Result<()> {
        self.write(batch, Some(last_seq), Durability::None)
    }

    fn get(&self, doc_id: &str) -> Result<Option<Bytes>> {
        let read_txn = self.db.begin_read().map_err(redb::Error::from)?;
        let docs = read_txn.open_table(DOCS).map_err(redb::Error::from)?;
        let value = docs
            .get(doc_id)
            .map_err(redb::Error::from)?
            .map(|v| Bytes::copy_from_slice(v.value()));
        Ok(value)
    }

    fn doc_count(&self) -> u64 {
        self.doc_count.load(Ordering::SeqCst)
    }

    fn applied_seq(&self) -> u64 {
        self.applied_seq.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<u64> {
        let _guard = self.write_lock.lock();
        let seq = self.applied_seq.load(Ordering::SeqCst);
        // An empty durable commit persists every earlier non-durable one
        let mut write_txn = self.db.begin_write().map_err(redb::Error::from)?;
        write_txn.set_durability(Durability::Immediate);
        write_txn.commit().map_err(redb::Error::from)?;
        Ok(seq)
    }

    fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map_or(0, |m| m.len())
    }
}

/// Segment held entirely in memory
#[derive(Default)]
pub struct MemorySegment {
    docs: RwLock<HashMap<String, Bytes>>,
    bytes: AtomicU64,
    applied_seq: AtomicU64,
}

impl MemorySegment {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentStore for MemorySegment {
    fn apply(&self, batch: &[PreparedOp], last_seq: u64) -> Result<()> {
        let mut docs = self.docs.write();
        for op in batch {
            match op {
                PreparedOp::Put { doc_id, source } => {
                    self.bytes.fetch_add(source.len() as u64, Ordering::Relaxed);
                    if let Some(old) = docs.insert(doc_id.clone(), source.clone()) {
                        self.bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
                    }
                }
                PreparedOp::Delete { doc_id } => {
                    if let Some(old) = docs.remove(doc_id) {
                        self.bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
                    }
                }
                PreparedOp::Skip => {}
            }
        }
        self.applied_seq.fetch_max(last_seq, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, doc_id: &str) -> Result<Option<Bytes>> {
        Ok(self.docs.read().get(doc_id).cloned())
    }

    fn doc_count(&self) -> u64 {
        self.docs.read().len() as u64
    }

    fn applied_seq(&self) -> u64 {
        self.applied_seq.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> Result<u64> {
        Ok(0)
    }

    fn size_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}
