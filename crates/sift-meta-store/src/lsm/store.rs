//! Log-structured metadata store with background compaction.

use super::memtable::{Memtable, MemtableConfig};
use crate::error::{MetaStoreError, MetaStoreResult, check_key};
use crate::store::MetaStore;
use async_trait::async_trait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sift_common::{RecordLog, RecordLogConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Record magic for the metadata log
const WAL_MAGIC: u32 = 0x4D57_414C; // "MWAL"

/// LSM store configuration
#[derive(Clone, Debug)]
pub struct LsmConfig {
    /// Base directory for the log and snapshots
    pub data_dir: PathBuf,
    pub wal: RecordLogConfig,
    pub memtable: MemtableConfig,
    /// Run snapshots on a background thread
    pub background_compaction: bool,
    /// How often the background thread checks for work
    pub compaction_interval: Duration,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./metadata"),
            wal: RecordLogConfig::default(),
            memtable: MemtableConfig::default(),
            background_compaction: true,
            compaction_interval: Duration::from_secs(60),
        }
    }
}

impl LsmConfig {
    /// Create config with data directory
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            memtable: MemtableConfig {
                snapshot_dir: data_dir.join("snapshots"),
                ..Default::default()
            },
            data_dir,
            ..Default::default()
        }
    }
}

/// Logged mutation
#[derive(Debug, Serialize, Deserialize)]
enum LsmOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// WAL and memtable, shared with the compaction thread
struct Engine {
    wal: RecordLog,
    memtable: Memtable,
    /// Serializes log-then-apply against snapshots so a snapshot never
    /// covers an LSN whose mutation is not yet in the table
    write_lock: Mutex<()>,
}

impl Engine {
    fn apply(&self, op: LsmOp) -> MetaStoreResult<u64> {
        let bytes = bincode::serialize(&op)?;
        let _guard = self.write_lock.lock();
        let lsn = self.wal.append(&bytes)?;
        match op {
            LsmOp::Put { key, value } => self.memtable.put(key, value, lsn),
            LsmOp::Delete { key } => {
                self.memtable.delete(&key, lsn);
            }
        }
        Ok(lsn)
    }

    fn needs_compaction(&self) -> bool {
        self.memtable.needs_snapshot() || self.wal.needs_compaction()
    }

    fn snapshot(&self) -> MetaStoreResult<u64> {
        let _guard = self.write_lock.lock();
        let lsn = self.memtable.write_snapshot()?;
        info!("Wrote metadata snapshot at LSN {}", lsn);

        if lsn > 0 {
            // Keep the snapshot LSN itself so numbering survives a reopen
            if let Err(e) = self.wal.truncate_before(lsn) {
                warn!("Failed to truncate metadata WAL: {}", e);
            } else {
                debug!("Truncated metadata WAL before LSN {}", lsn);
            }
        }
        Ok(lsn)
    }
}

struct Compactor {
    stop: Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Embedded WAL + memtable + snapshot metadata store
pub struct LsmStore {
    engine: RwLock<Option<Arc<Engine>>>,
    compactor: Mutex<Option<Compactor>>,
    config: LsmConfig,
}

impl LsmStore {
    /// Open the store, loading the newest snapshot and replaying the log
    pub fn open(config: LsmConfig) -> MetaStoreResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.memtable.snapshot_dir)?;

        let wal = RecordLog::open(
            config.data_dir.join("metadata.wal"),
            WAL_MAGIC,
            config.wal.clone(),
        )?;
        let memtable = Memtable::load(config.memtable.clone())?;
        let snapshot_lsn = memtable.last_snapshot_lsn();
        wal.advance_to(snapshot_lsn);

        info!("Replaying metadata WAL from LSN {}", snapshot_lsn + 1);
        let mut replayed = 0u64;
        wal.replay(snapshot_lsn + 1, |lsn, data| {
            let op: LsmOp = bincode::deserialize(data)
                .map_err(|e| sift_common::Error::Corrupt(format!("WAL record {lsn}: {e}")))?;
            match op {
                LsmOp::Put { key, value } => memtable.put(key, value, lsn),
                LsmOp::Delete { key } => {
                    memtable.delete(&key, lsn);
                }
            }
            replayed += 1;
            Ok(())
        })?;
        info!("Replayed {} metadata WAL records", replayed);

        let engine = Arc::new(Engine {
            wal,
            memtable,
            write_lock: Mutex::new(()),
        });

        let compactor = config
            .background_compaction
            .then(|| Self::start_background_compaction(&engine, config.compaction_interval));

        info!(
            "Opened LSM metadata store at {:?} ({} keys)",
            config.data_dir,
            engine.memtable.len()
        );
        Ok(Self {
            engine: RwLock::new(Some(engine)),
            compactor: Mutex::new(compactor),
            config,
        })
    }

    fn start_background_compaction(engine: &Arc<Engine>, interval: Duration) -> Compactor {
        let (stop, stopped): (Sender<()>, Receiver<()>) = bounded(1);
        let engine = Arc::clone(engine);

        let handle = thread::spawn(move || {
            debug!("Background compaction thread started");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if engine.needs_compaction() {
                    if let Err(e) = engine.snapshot() {
                        error!("Background snapshot failed: {}", e);
                    }
                }
            }
            debug!("Background compaction thread stopped");
        });

        Compactor { stop, handle }
    }

    fn engine(&self) -> MetaStoreResult<Arc<Engine>> {
        self.engine.read().clone().ok_or(MetaStoreError::Closed)
    }

    /// Force a snapshot and log truncation. Returns the snapshot LSN.
    pub fn snapshot(&self) -> MetaStoreResult<u64> {
        self.engine()?.snapshot()
    }

    /// Flush the log to stable storage
    pub fn sync(&self) -> MetaStoreResult<()> {
        self.engine()?.wal.sync()?;
        Ok(())
    }

    /// Current statistics
    pub fn stats(&self) -> MetaStoreResult<LsmStats> {
        let engine = self.engine()?;
        Ok(LsmStats {
            entry_count: engine.memtable.len(),
            wal_size: engine.wal.size(),
            wal_lsn: engine.wal.current_lsn(),
            last_snapshot_lsn: engine.memtable.last_snapshot_lsn(),
        })
    }

    /// Data directory
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    fn shutdown(&self) -> MetaStoreResult<()> {
        if let Some(compactor) = self.compactor.lock().take() {
            let _ = compactor.stop.send(());
            if compactor.handle.join().is_err() {
                error!("Compaction thread panicked");
            }
        }
        if let Some(engine) = self.engine.write().take() {
            engine.wal.sync()?;
            debug!("Closed LSM metadata store at {:?}", self.config.data_dir);
        }
        Ok(())
    }
}

impl Drop for LsmStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Failed to sync metadata WAL on shutdown: {}", e);
        }
    }
}

#[async_trait]
impl MetaStore for LsmStore {
    async fn get(&self, key: &str) -> MetaStoreResult<Vec<u8>> {
        check_key(key)?;
        self.engine()?
            .memtable
            .get(key)
            .ok_or_else(|| MetaStoreError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> MetaStoreResult<()> {
        check_key(key)?;
        let lsn = self.engine()?.apply(LsmOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        debug!("put {}: lsn={}", key, lsn);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MetaStoreResult<()> {
        check_key(key)?;
        let lsn = self.engine()?.apply(LsmOp::Delete {
            key: key.to_string(),
        })?;
        debug!("delete {}: lsn={}", key, lsn);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self.engine()?.memtable.scan_prefix(prefix, offset, limit))
    }

    async fn close(&self) -> MetaStoreResult<()> {
        self.shutdown()
    }

    fn backend(&self) -> &'static str {
        "lsm"
    }
}

/// LSM store statistics
#[derive(Debug, Clone)]
pub struct LsmStats {
    /// Number of live keys
    pub entry_count: usize,
    /// WAL size in bytes
    pub wal_size: u64,
    /// Last assigned WAL LSN
    pub wal_lsn: u64,
    /// Last snapshot LSN
    pub last_snapshot_lsn: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> LsmConfig {
        let mut config = LsmConfig::with_data_dir(dir.join("meta"));
        config.wal.sync_on_write = false;
        config.background_compaction = false;
        config
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(test_config(dir.path())).unwrap();
        conformance::set_get_delete(&store).await;
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(test_config(dir.path())).unwrap();
        conformance::empty_key_rejected(&store).await;
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(test_config(dir.path())).unwrap();
        conformance::list_prefix_order_and_paging(&store).await;
    }

    #[tokio::test]
    async fn test_closed_store() {
        let dir = tempdir().unwrap();
        let store = LsmStore::open(test_config(dir.path())).unwrap();
        conformance::closed_store_rejects(&store).await;
    }

    #[tokio::test]
    async fn test_recovery_from_wal() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(test_config(dir.path())).unwrap();
            store.set("/a", b"1").await.unwrap();
            store.set("/b", b"2").await.unwrap();
            store.delete("/a").await.unwrap();
            store.close().await.unwrap();
        }

        let store = LsmStore::open(test_config(dir.path())).unwrap();
        assert!(store.get("/a").await.unwrap_err().is_not_found());
        assert_eq!(store.get("/b").await.unwrap(), b"2");
        assert_eq!(store.stats().unwrap().wal_lsn, 3);
    }

    #[tokio::test]
    async fn test_snapshot_and_recovery() {
        let dir = tempdir().unwrap();
        {
            let store = LsmStore::open(test_config(dir.path())).unwrap();
            for i in 0..50 {
                store
                    .set(&format!("/index/{i:03}"), format!("v{i}").as_bytes())
                    .await
                    .unwrap();
            }
            let before = store.stats().unwrap().wal_size;
            assert_eq!(store.snapshot().unwrap(), 50);
            assert!(store.stats().unwrap().wal_size < before);

            // Written after the snapshot, recovered from the log tail
            store.set("/index/050", b"v50").await.unwrap();
            store.delete("/index/000").await.unwrap();
            store.close().await.unwrap();
        }

        let store = LsmStore::open(test_config(dir.path())).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.last_snapshot_lsn, 50);
        assert_eq!(stats.entry_count, 50);
        assert_eq!(store.get("/index/050").await.unwrap(), b"v50");
        assert!(store.get("/index/000").await.unwrap_err().is_not_found());

        // Numbering continues past everything seen before
        store.set("/index/051", b"v51").await.unwrap();
        assert_eq!(store.stats().unwrap().wal_lsn, 53);
    }

    #[tokio::test]
    async fn test_background_compaction_stops_on_close() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.background_compaction = true;
        config.compaction_interval = Duration::from_millis(10);
        config.memtable.snapshot_threshold = 5;

        let store = LsmStore::open(config).unwrap();
        for i in 0..10 {
            store.set(&format!("/k{i}"), b"v").await.unwrap();
        }

        let mut snapshotted = false;
        for _ in 0..200 {
            if store.stats().unwrap().last_snapshot_lsn > 0 {
                snapshotted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(snapshotted, "background compaction never ran");

        store.close().await.unwrap();
        assert!(matches!(store.get("/k1").await, Err(MetaStoreError::Closed)));
    }
}
