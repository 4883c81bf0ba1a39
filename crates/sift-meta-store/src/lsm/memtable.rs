//! Ordered in-memory table with checksummed snapshots.

use crate::error::{MetaStoreError, MetaStoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Snapshot file header
#[derive(Clone, Copy, Debug)]
struct SnapshotHeader {
    lsn: u64,
    entry_count: u64,
    /// CRC32C of snapshot data (excluding header)
    checksum: u32,
    /// Creation time, seconds since the Unix epoch
    created_at: u32,
}

impl SnapshotHeader {
    const MAGIC: u32 = 0x5346_5453; // "SFTS"
    const VERSION: u32 = 1;
    const SIZE: usize = 32;

    fn new(lsn: u64, entry_count: u64, checksum: u32) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
            .unwrap_or_default();
        Self {
            lsn,
            entry_count,
            checksum,
            created_at,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&Self::VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[28..32].copy_from_slice(&self.created_at.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8; Self::SIZE]) -> Option<Self> {
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(b)
        };
        if u32_at(0) != Self::MAGIC || u32_at(4) != Self::VERSION {
            return None;
        }
        Some(Self {
            lsn: u64_at(8),
            entry_count: u64_at(16),
            checksum: u32_at(24),
            created_at: u32_at(28),
        })
    }
}

/// Memtable configuration
#[derive(Clone, Debug)]
pub struct MemtableConfig {
    /// Directory for snapshot files
    pub snapshot_dir: PathBuf,
    /// Number of mutations before a snapshot is due
    pub snapshot_threshold: u64,
    /// Number of snapshots to keep
    pub snapshot_retention: usize,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("./snapshots"),
            snapshot_threshold: 10_000,
            snapshot_retention: 2,
        }
    }
}

/// Ordered key-value table
pub struct Memtable {
    tree: RwLock<BTreeMap<String, Vec<u8>>>,
    /// Highest LSN applied
    lsn: AtomicU64,
    mutations_since_snapshot: AtomicU64,
    last_snapshot_lsn: AtomicU64,
    config: MemtableConfig,
}

impl Memtable {
    /// Create an empty table
    #[must_use]
    pub fn new(config: MemtableConfig) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            lsn: AtomicU64::new(0),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(0),
            config,
        }
    }

    /// Load the newest readable snapshot, or start empty when none exists.
    ///
    /// A snapshot that fails its checksum is skipped in favour of the next
    /// older one.
    pub fn load(config: MemtableConfig) -> MetaStoreResult<Self> {
        for (path, _) in list_snapshots(&config.snapshot_dir)? {
            match read_snapshot(&path) {
                Ok((tree, header)) => {
                    debug!(
                        "Loaded snapshot {:?}: lsn={}, entries={}",
                        path,
                        header.lsn,
                        tree.len()
                    );
                    return Ok(Self {
                        tree: RwLock::new(tree),
                        lsn: AtomicU64::new(header.lsn),
                        mutations_since_snapshot: AtomicU64::new(0),
                        last_snapshot_lsn: AtomicU64::new(header.lsn),
                        config,
                    });
                }
                Err(e) => warn!("Skipping unreadable snapshot {:?}: {}", path, e),
            }
        }
        Ok(Self::new(config))
    }

    /// Insert or update a key
    pub fn put(&self, key: String, value: Vec<u8>, lsn: u64) {
        self.tree.write().insert(key, value);
        self.mutated(lsn);
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, key: &str, lsn: u64) -> bool {
        let existed = self.tree.write().remove(key).is_some();
        self.mutated(lsn);
        existed
    }

    /// Look up a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.tree.read().get(key).cloned()
    }

    /// Page through keys starting with `prefix`, in key order
    #[must_use]
    pub fn scan_prefix(&self, prefix: &str, offset: usize, limit: usize) -> Vec<(String, Vec<u8>)> {
        let tree = self.tree.read();
        let matches = tree
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()));
        crate::store::paginate(matches, offset, limit)
    }

    /// Write the table to a new snapshot file and prune old ones.
    /// Returns the snapshot LSN.
    pub fn write_snapshot(&self) -> MetaStoreResult<u64> {
        let (lsn, data, entry_count) = {
            let tree = self.tree.read();
            let lsn = self.lsn.load(Ordering::SeqCst);
            let entries: Vec<(&String, &Vec<u8>)> = tree.iter().collect();
            (lsn, bincode::serialize(&entries)?, entries.len() as u64)
        };

        let header = SnapshotHeader::new(lsn, entry_count, crc32c::crc32c(&data));

        std::fs::create_dir_all(&self.config.snapshot_dir)?;
        let snapshot_name = format!("meta_{lsn}.snapshot");
        let snapshot_path = self.config.snapshot_dir.join(&snapshot_name);
        let temp_path = self.config.snapshot_dir.join(format!("{snapshot_name}.tmp"));

        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&data)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        // Atomic rename
        std::fs::rename(&temp_path, &snapshot_path)?;

        self.last_snapshot_lsn.store(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);

        self.cleanup_old_snapshots()?;
        Ok(lsn)
    }

    fn cleanup_old_snapshots(&self) -> MetaStoreResult<()> {
        for (path, _) in list_snapshots(&self.config.snapshot_dir)?
            .into_iter()
            .skip(self.config.snapshot_retention)
        {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to remove old snapshot {:?}: {}", path, e);
            }
        }
        Ok(())
    }

    /// Whether enough mutations accumulated to warrant a snapshot
    #[must_use]
    pub fn needs_snapshot(&self) -> bool {
        self.mutations_since_snapshot.load(Ordering::Relaxed) >= self.config.snapshot_threshold
    }

    /// Highest applied LSN
    #[must_use]
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    /// LSN of the last snapshot written or loaded
    #[must_use]
    pub fn last_snapshot_lsn(&self) -> u64 {
        self.last_snapshot_lsn.load(Ordering::SeqCst)
    }

    /// Number of live keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Whether the table holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    fn mutated(&self, lsn: u64) {
        self.lsn.fetch_max(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot files in `dir`, newest first
fn list_snapshots(dir: &Path) -> MetaStoreResult<Vec<(PathBuf, u64)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots: Vec<(PathBuf, u64)> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let lsn = name
                .to_str()?
                .strip_prefix("meta_")?
                .strip_suffix(".snapshot")?
                .parse::<u64>()
                .ok()?;
            Some((entry.path(), lsn))
        })
        .collect();

    snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
    Ok(snapshots)
}

fn read_snapshot(path: &Path) -> MetaStoreResult<(BTreeMap<String, Vec<u8>>, SnapshotHeader)> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header_buf = [0u8; SnapshotHeader::SIZE];
    reader.read_exact(&mut header_buf)?;
    let header = SnapshotHeader::from_bytes(&header_buf)
        .ok_or_else(|| MetaStoreError::Corrupt(format!("invalid snapshot header in {path:?}")))?;

    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    if crc32c::crc32c(&data) != header.checksum {
        return Err(MetaStoreError::Corrupt(format!(
            "snapshot checksum mismatch in {path:?}"
        )));
    }

    let entries: Vec<(String, Vec<u8>)> = bincode::deserialize(&data)?;
    if entries.len() as u64 != header.entry_count {
        return Err(MetaStoreError::Corrupt(format!(
            "snapshot entry count mismatch in {path:?}"
        )));
    }
    Ok((entries.into_iter().collect(), header))
}
