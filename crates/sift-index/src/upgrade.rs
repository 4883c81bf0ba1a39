//! On-disk upgrades for index directories.
//!
//! An index directory carries a `VERSION` file. At startup every index is
//! walked through an ordered list of `(from, to, step)` migrations until it
//! reaches [`CURRENT_VERSION`]:
//!
//! ```text
//! 0.1.0 -> 0.2.0   data/ becomes shards/000000/
//! 0.2.0 -> 0.3.0   settings.number_of_shards -> shard_num, storage_type -> storage_kind
//! 0.3.0 -> 0.4.0   documents in shard 0 move to their routed shard
//! ```
//!
//! Each step is safe to run again. The definition is persisted and then the
//! version marker is replaced atomically, only after the step's side effects
//! are durable, so a crash mid-chain resumes from the last completed step.

use crate::error::{IndexError, Result};
use crate::index::route;
use crate::meta::now_ms;
use crate::segment::{RedbSegment, SegmentStore};
use crate::shard::{prepare, shard_dir};
use crate::wal::{ShardWal, WalEntry};
use bytes::Bytes;
use serde_json::{Map, Value};
use sift_common::config::WalConfig;
use sift_common::{Config, StorageKind};
use sift_meta_store::{MetaStore, keys, set_json};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk version written by this build
pub const CURRENT_VERSION: &str = "0.4.0";

/// Version marker file inside an index directory
pub const VERSION_FILE: &str = "VERSION";

/// Single-shard data directory used before shards existed
const LEGACY_DATA_DIR: &str = "data";

/// Version assumed for a legacy directory without a marker
const LEGACY_VERSION: &str = "0.1.0";

type Version = (u32, u32, u32);

fn parse_version(s: &str) -> Option<Version> {
    let mut parts = s.trim().split('.').map(|p| p.parse::<u32>().ok());
    let version = (parts.next()??, parts.next()??, parts.next()??);
    parts.next().is_none().then_some(version)
}

/// Working state of one index while it is being migrated
#[derive(Debug)]
pub struct Migration {
    pub name: String,
    pub index_dir: PathBuf,
    /// Definition as raw JSON; older shapes do not match `IndexMeta`
    pub meta: Value,
    pub wal: WalConfig,
}

type StepFn = fn(&mut Migration) -> Result<()>;

/// Ordered migration chain ending at `CURRENT_VERSION`
const STEPS: &[(&str, &str, StepFn)] = &[
    ("0.1.0", "0.2.0", reshape_layout),
    ("0.2.0", "0.3.0", remap_schema),
    ("0.3.0", "0.4.0", repartition),
];

/// Runs migrations for index directories
#[derive(Clone, Debug)]
pub struct UpgradePipeline {
    compatible: Vec<Version>,
    wal: WalConfig,
}

impl UpgradePipeline {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let compatible = config
            .upgrade
            .compatible_versions
            .iter()
            .filter_map(|v| {
                let parsed = parse_version(v);
                if parsed.is_none() {
                    warn!("Ignoring malformed compatible version {:?}", v);
                }
                parsed
            })
            .collect();
        Self {
            compatible,
            wal: config.wal.clone(),
        }
    }

    /// Read the version marker of an index directory
    pub fn detect_version(index_dir: &Path) -> Result<String> {
        match fs::read_to_string(index_dir.join(VERSION_FILE)) {
            Ok(s) => Ok(s.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if index_dir.join(LEGACY_DATA_DIR).is_dir() {
                    Ok(LEGACY_VERSION.to_string())
                } else {
                    Ok(CURRENT_VERSION.to_string())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bring the index in `index_dir` up to `CURRENT_VERSION` and return its
    /// final definition.
    pub async fn upgrade(
        &self,
        name: &str,
        index_dir: &Path,
        meta: Value,
        store: &dyn MetaStore,
    ) -> Result<Value> {
        let found = Self::detect_version(index_dir)?;
        let version =
            parse_version(&found).ok_or_else(|| IndexError::UnsupportedVersion(found.clone()))?;
        let current = parse_version(CURRENT_VERSION)
            .ok_or_else(|| IndexError::Internal("malformed current version".into()))?;

        if version > current {
            if self.compatible.contains(&version) {
                info!(
                    "Index {} is at newer version {}, listed as compatible",
                    name, found
                );
                return Ok(meta);
            }
            return Err(IndexError::UnsupportedVersion(format!(
                "{found} is newer than {CURRENT_VERSION}"
            )));
        }
        if version == current {
            if !index_dir.join(VERSION_FILE).exists() {
                write_version(index_dir, CURRENT_VERSION)?;
            }
            return Ok(meta);
        }

        let start = STEPS
            .iter()
            .position(|(from, _, _)| parse_version(from) == Some(version))
            .ok_or_else(|| IndexError::UnsupportedVersion(found.clone()))?;

        let mut migration = Migration {
            name: name.to_string(),
            index_dir: index_dir.to_path_buf(),
            meta,
            wal: self.wal.clone(),
        };
        for &(from, to, step) in &STEPS[start..] {
            info!("Upgrading index {} from {} to {}", name, from, to);
            let failed = |reason: String| IndexError::Migration {
                from: from.to_string(),
                to: to.to_string(),
                reason,
            };

            migration = tokio::task::spawn_blocking(move || {
                let mut migration = migration;
                step(&mut migration).map(|()| migration)
            })
            .await?
            .map_err(|e| failed(e.to_string()))?;

            if let Some(obj) = migration.meta.as_object_mut() {
                obj.insert("version".into(), Value::String(to.to_string()));
            }
            set_json(store, &keys::index(name), &migration.meta)
                .await
                .map_err(|e| failed(e.to_string()))?;
            write_version(index_dir, to).map_err(|e| failed(e.to_string()))?;
        }

        info!("Index {} upgraded to {}", name, CURRENT_VERSION);
        Ok(migration.meta)
    }
}

/// Atomically replace the version marker
pub fn write_version(index_dir: &Path, version: &str) -> Result<()> {
    fs::create_dir_all(index_dir)?;
    let tmp = index_dir.join(format!("{VERSION_FILE}.tmp"));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(version.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, index_dir.join(VERSION_FILE))?;
    sync_dir(index_dir);
    Ok(())
}

fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

fn meta_object(migration: &mut Migration) -> Result<&mut Map<String, Value>> {
    migration.meta.as_object_mut().ok_or_else(|| {
        IndexError::Serialization(format!("definition of {} is not an object", migration.name))
    })
}

fn shard_num_of(meta: &Value) -> u32 {
    meta.get("shard_num")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(1)
}

/// 0.1.0 -> 0.2.0: move the single data directory into shard 0
fn reshape_layout(migration: &mut Migration) -> Result<()> {
    let legacy = migration.index_dir.join(LEGACY_DATA_DIR);
    if !legacy.is_dir() {
        return Ok(());
    }

    let target = shard_dir(&migration.index_dir, 0);
    if target.exists() {
        return Err(IndexError::Internal(format!(
            "both {} and {} exist",
            legacy.display(),
            target.display()
        )));
    }
    let shards = migration.index_dir.join("shards");
    fs::create_dir_all(&shards)?;
    fs::rename(&legacy, &target)?;
    sync_dir(&shards);
    sync_dir(&migration.index_dir);
    debug!("Moved {:?} to {:?}", legacy, target);
    Ok(())
}

/// 0.2.0 -> 0.3.0: lift shard count and storage kind to top-level fields
fn remap_schema(migration: &mut Migration) -> Result<()> {
    let name = migration.name.clone();
    let obj = meta_object(migration)?;

    let legacy_shards = obj
        .get_mut("settings")
        .and_then(Value::as_object_mut)
        .and_then(|settings| settings.remove("number_of_shards"));
    if !obj.contains_key("shard_num") {
        let shard_num = legacy_shards
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
            .unwrap_or(1);
        obj.insert("shard_num".into(), Value::from(shard_num));
    }

    if let Some(kind) = obj.remove("storage_type") {
        obj.entry("storage_kind").or_insert(kind);
    }
    obj.entry("storage_kind")
        .or_insert_with(|| Value::String(StorageKind::Disk.to_string()));

    let now = now_ms();
    obj.entry("name").or_insert_with(|| Value::String(name));
    obj.entry("settings").or_insert_with(|| Value::Object(Map::new()));
    obj.entry("mappings").or_insert_with(|| Value::Object(Map::new()));
    obj.entry("created_at").or_insert_with(|| Value::from(now));
    obj.entry("updated_at").or_insert_with(|| Value::from(now));
    Ok(())
}

/// 0.3.0 -> 0.4.0: move every document of shard 0 to its routed shard
fn repartition(migration: &mut Migration) -> Result<()> {
    let shard_num = shard_num_of(&migration.meta);
    let source_dir = shard_dir(&migration.index_dir, 0);
    if shard_num <= 1 || !source_dir.is_dir() {
        return Ok(());
    }

    let kind: StorageKind = migration
        .meta
        .get("storage_kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse()
        .map_err(|e: sift_common::Error| IndexError::Internal(e.to_string()))?;

    let moved = match kind {
        StorageKind::Disk => repartition_segment(&migration.index_dir, shard_num, &migration.wal)?,
        StorageKind::Memory => repartition_wal(&migration.index_dir, shard_num, &migration.wal)?,
    };
    info!(
        "Index {}: moved {} documents out of shard 0 into {} shards",
        migration.name, moved, shard_num
    );
    Ok(())
}

/// Disk indices: fold the WAL into the segment, copy foreign documents to
/// their shards, then remove them from shard 0.
fn repartition_segment(index_dir: &Path, shard_num: u32, wal_config: &WalConfig) -> Result<usize> {
    let source_dir = shard_dir(index_dir, 0);
    let source = RedbSegment::open(&source_dir)?;
    let wal = ShardWal::open(&source_dir, wal_config)?;
    wal.advance_to(source.applied_seq());

    let mut pending = Vec::new();
    let mut last_seq = source.applied_seq();
    wal.replay_after(source.applied_seq(), |entry| {
        last_seq = entry.seq;
        pending.push(prepare(entry));
        Ok(())
    })?;
    if !pending.is_empty() {
        source.apply(&pending, last_seq)?;
    }
    let durable = source.checkpoint()?;
    wal.truncate_before(durable + 1)?;

    let mut by_shard: HashMap<u32, Vec<(String, Bytes)>> = HashMap::new();
    for (doc_id, body) in source.documents()? {
        let target = route(&doc_id, shard_num);
        if target != 0 {
            by_shard.entry(target).or_default().push((doc_id, body));
        }
    }

    let mut moved_ids = Vec::new();
    for (target, docs) in by_shard {
        let segment = RedbSegment::open(&shard_dir(index_dir, target))?;
        segment.import(&docs)?;
        moved_ids.extend(docs.into_iter().map(|(doc_id, _)| doc_id));
    }
    source.purge(&moved_ids)?;
    Ok(moved_ids.len())
}

/// Memory indices keep documents only in the WAL: copy foreign entries to
/// their shard's log, sync, then drop them from shard 0's log.
fn repartition_wal(index_dir: &Path, shard_num: u32, wal_config: &WalConfig) -> Result<usize> {
    let source = ShardWal::open(&shard_dir(index_dir, 0), wal_config)?;

    let mut by_shard: HashMap<u32, Vec<WalEntry>> = HashMap::new();
    source.replay_after(0, |entry| {
        let target = route(&entry.doc_id, shard_num);
        if target != 0 {
            by_shard.entry(target).or_default().push(entry);
        }
        Ok(())
    })?;

    let mut moved = 0;
    for (target, entries) in by_shard {
        let dir = shard_dir(index_dir, target);
        fs::create_dir_all(&dir)?;
        let wal = ShardWal::open(&dir, wal_config)?;
        for entry in &entries {
            wal.append(entry)?;
        }
        wal.sync()?;
        moved += entries.len();
    }

    source.retain(|entry| route(&entry.doc_id, shard_num) == 0)?;
    Ok(moved)
}
