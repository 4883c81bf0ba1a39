//! Persisted index definitions and reported statistics.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sift_common::StorageKind;

/// Index definition stored as JSON at `/index/{name}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub name: String,
    #[serde(default)]
    pub storage_kind: StorageKind,
    pub shard_num: u32,
    #[serde(default = "empty_object")]
    pub settings: Value,
    #[serde(default = "empty_object")]
    pub mappings: Value,
    /// On-disk format version the index was last written with
    pub version: String,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl IndexMeta {
    /// New definition at the current on-disk version
    #[must_use]
    pub fn new(name: impl Into<String>, storage_kind: StorageKind, shard_num: u32) -> Self {
        let now = now_ms();
        Self {
            name: name.into(),
            storage_kind,
            shard_num,
            settings: empty_object(),
            mappings: empty_object(),
            version: crate::upgrade::CURRENT_VERSION.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the modification time
    pub fn touch(&mut self) {
        self.updated_at = now_ms().max(self.created_at);
    }
}

/// Point-in-time statistics for one index
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Committed documents across all shards
    pub doc_count: u64,
    /// Segment bytes as of the last sync tick
    pub storage_size: u64,
    /// Bytes held in shard write-ahead logs
    pub wal_size: u64,
    pub shard_num: u32,
}

/// Aggregate figures for periodic usage reporting
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub index_count: usize,
    pub doc_count: u64,
    pub total_index_size_mb: f64,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meta_defaults_from_sparse_json() {
        let meta: IndexMeta = serde_json::from_value(json!({
            "name": "logs",
            "shard_num": 4,
            "version": "0.4.0",
            "created_at": 1,
            "updated_at": 1
        }))
        .unwrap();
        assert_eq!(meta.storage_kind, StorageKind::Disk);
        assert_eq!(meta.settings, json!({}));
        assert_eq!(meta.mappings, json!({}));
    }

    #[test]
    fn test_meta_json_shape() {
        let meta = IndexMeta::new("logs", StorageKind::Memory, 2);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["storage_kind"], "memory");
        assert_eq!(value["shard_num"], 2);
        assert_eq!(value["version"], crate::upgrade::CURRENT_VERSION);
        assert!(meta.created_at > 0);
    }
}
