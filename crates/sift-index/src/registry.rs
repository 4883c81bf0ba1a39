//! Directory of open indices.
//!
//! Definitions live in the metadata store under `/index/{name}`; data lives
//! in `{data_path}/{name}/`. Structural changes are persisted to the store
//! before the in-memory directory changes. At startup every definition is
//! upgraded and opened; an index that fails is parked as unavailable
//! without affecting the others.

use crate::error::{IndexError, Result};
use crate::index::Index;
use crate::meta::{IndexMeta, Usage};
use crate::upgrade::{CURRENT_VERSION, UpgradePipeline, write_version};
use dashmap::DashMap;
use serde_json::Value;
use sift_common::{Config, IndexName, MAX_SHARD_NUM, Node, StorageKind};
use sift_meta_store::{MetaStore, keys, set_json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The set of indices served by this node
pub struct Registry {
    indices: DashMap<String, Arc<Index>>,
    /// Indices whose definition exists but which failed to load
    unavailable: DashMap<String, String>,
    /// Serializes create and delete; reads never take it
    structure: tokio::sync::Mutex<()>,
    store: Arc<dyn MetaStore>,
    node: Arc<Node>,
    config: Config,
    pipeline: UpgradePipeline,
}

impl Registry {
    /// Rehydrate every persisted index, upgrading each before it serves
    /// traffic.
    pub async fn open(config: Config, store: Arc<dyn MetaStore>, node: Arc<Node>) -> Result<Self> {
        std::fs::create_dir_all(&config.server.data_path)?;
        let registry = Self {
            indices: DashMap::new(),
            unavailable: DashMap::new(),
            structure: tokio::sync::Mutex::new(()),
            pipeline: UpgradePipeline::new(&config),
            store,
            node,
            config,
        };

        let definitions = registry.store.list(keys::INDEX_PREFIX, 0, 0).await?;
        for (key, raw) in definitions {
            let Some(name) = keys::index_name(&key) else {
                continue;
            };
            match registry.load(name, &raw).await {
                Ok(index) => {
                    registry.indices.insert(name.to_string(), Arc::new(index));
                }
                Err(e) => {
                    error!("Index {} is unavailable: {}", name, e);
                    registry.unavailable.insert(name.to_string(), e.to_string());
                }
            }
        }

        info!(
            "Registry opened: {} indices available, {} unavailable",
            registry.indices.len(),
            registry.unavailable.len()
        );
        Ok(registry)
    }

    async fn load(&self, name: &str, raw: &[u8]) -> Result<Index> {
        let dir = self.index_dir(name);
        let meta: Value = serde_json::from_slice(raw)?;
        let meta = self
            .pipeline
            .upgrade(name, &dir, meta, self.store.as_ref())
            .await?;
        let meta: IndexMeta = serde_json::from_value(meta)?;
        if meta.shard_num == 0 || meta.shard_num > MAX_SHARD_NUM {
            return Err(IndexError::InvalidShardCount(meta.shard_num));
        }
        self.open_index(meta, dir)
    }

    fn open_index(&self, meta: IndexMeta, dir: PathBuf) -> Result<Index> {
        Index::open(
            meta,
            dir,
            Arc::clone(&self.store),
            Arc::clone(&self.node),
            &self.config,
        )
    }

    fn index_dir(&self, name: &str) -> PathBuf {
        self.config.server.data_path.join(name)
    }

    /// Create an index and persist its definition
    pub async fn create(
        &self,
        name: &str,
        storage_kind: StorageKind,
        shard_num: u32,
        settings: Value,
        mappings: Value,
    ) -> Result<Arc<Index>> {
        let name = IndexName::new(name)?;
        if shard_num == 0 || shard_num > MAX_SHARD_NUM {
            return Err(IndexError::InvalidShardCount(shard_num));
        }

        let _guard = self.structure.lock().await;
        let key = keys::index(name.as_str());
        if self.indices.contains_key(name.as_str()) || self.unavailable.contains_key(name.as_str()) {
            return Err(IndexError::AlreadyExists(name.to_string()));
        }
        match self.store.get(&key).await {
            Ok(_) => return Err(IndexError::AlreadyExists(name.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let mut meta = IndexMeta::new(name.as_str(), storage_kind, shard_num);
        meta.settings = settings;
        meta.mappings = mappings;
        set_json(self.store.as_ref(), &key, &meta).await?;

        let dir = self.index_dir(name.as_str());
        if dir.exists() {
            warn!("Removing stale data for unregistered index {}", name);
            tokio::fs::remove_dir_all(&dir).await?;
        }
        let opened =
            write_version(&dir, CURRENT_VERSION).and_then(|()| self.open_index(meta, dir.clone()));
        let index = match opened {
            Ok(index) => Arc::new(index),
            Err(e) => {
                if let Err(rollback) = self.store.delete(&key).await {
                    warn!("Failed to roll back definition of {}: {}", name, rollback);
                }
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        self.indices.insert(name.to_string(), Arc::clone(&index));
        info!(
            "Created index {}: shards={}, storage={}",
            name, shard_num, storage_kind
        );
        Ok(index)
    }

    /// Look up an available index
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indices.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up an index, creating it with default settings when automatic
    /// creation is enabled
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<Index>> {
        if let Some(index) = self.get(name) {
            return Ok(index);
        }
        if !self.config.server.auto_create_index {
            return Err(IndexError::not_found(format!("index {name}")));
        }

        let empty = || Value::Object(serde_json::Map::new());
        match self
            .create(name, StorageKind::Disk, self.config.shard.num, empty(), empty())
            .await
        {
            Err(IndexError::AlreadyExists(_)) => self
                .get(name)
                .ok_or_else(|| IndexError::Unavailable {
                    index: name.to_string(),
                    reason: "definition exists but the index is not loaded".into(),
                }),
            other => other,
        }
    }

    /// Available indices ordered by name
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Index>> {
        let mut entries: Vec<(String, Arc<Index>)> = self
            .indices
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, index)| index).collect()
    }

    /// Indices that failed to load, with the reason, ordered by name
    #[must_use]
    pub fn unavailable(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .unavailable
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort();
        entries
    }

    /// Remove an index: definition first, then the open handle, then data
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.structure.lock().await;
        if !self.indices.contains_key(name) && !self.unavailable.contains_key(name) {
            return Err(IndexError::not_found(format!("index {name}")));
        }

        self.store.delete(&keys::index(name)).await?;
        self.unavailable.remove(name);
        if let Some((_, index)) = self.indices.remove(name) {
            if let Err(e) = index.close().await {
                warn!("Index {} did not close cleanly: {}", name, e);
            }
        }

        let dir = self.index_dir(name);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        info!("Deleted index {}", name);
        Ok(())
    }

    /// Totals across available indices for periodic usage reporting
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn usage(&self) -> Usage {
        let mut usage = Usage::default();
        let mut bytes = 0u64;
        for index in self.list() {
            let stats = index.stats();
            usage.index_count += 1;
            usage.doc_count += stats.doc_count;
            bytes += stats.storage_size + stats.wal_size;
        }
        usage.total_index_size_mb = bytes as f64 / (1024.0 * 1024.0);
        usage
    }

    /// Close every index. All indices are attempted; failures are returned
    /// together.
    pub async fn close_all(&self) -> Result<()> {
        let indices: Vec<(String, Arc<Index>)> = self
            .indices
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let results = futures::future::join_all(
            indices
                .iter()
                .map(|(name, index)| async move { (name.clone(), index.close().await) }),
        )
        .await;
        self.indices.clear();

        let errors: Vec<(String, IndexError)> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();
        if errors.is_empty() {
            info!("Closed {} indices", indices.len());
            Ok(())
        } else {
            for (name, e) in &errors {
                error!("Failed to close index {}: {}", name, e);
            }
            Err(IndexError::CloseFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sift_meta_store::{RedbStore, get_json};
    use tempfile::{TempDir, tempdir};

    struct Env {
        dir: TempDir,
        store: Arc<dyn MetaStore>,
        node: Arc<Node>,
    }

    impl Env {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let store: Arc<dyn MetaStore> =
                Arc::new(RedbStore::open(dir.path().join("_metadata.redb")).unwrap());
            Self {
                dir,
                store,
                node: Arc::new(Node::new(2).unwrap()),
            }
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.server.data_path = self.dir.path().to_path_buf();
            config.wal.sync_interval_ms = 50;
            config.shard.worker_num = 2;
            config
        }

        async fn registry(&self) -> Registry {
            self.registry_with(self.config()).await
        }

        async fn registry_with(&self, config: Config) -> Registry {
            Registry::open(config, Arc::clone(&self.store), Arc::clone(&self.node))
                .await
                .unwrap()
        }
    }

    fn empty() -> Value {
        json!({})
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_get_list_delete() {
        let env = Env::new();
        let registry = env.registry().await;

        registry
            .create("metrics", StorageKind::Disk, 2, empty(), empty())
            .await
            .unwrap();
        registry
            .create("logs", StorageKind::Memory, 4, json!({ "a": 1 }), empty())
            .await
            .unwrap();

        let names: Vec<String> = registry.list().iter().map(|i| i.name()).collect();
        assert_eq!(names, vec!["logs", "metrics"]);

        let logs = registry.get("logs").unwrap();
        assert_eq!(logs.shard_num(), 4);
        assert_eq!(logs.storage_kind(), StorageKind::Memory);
        assert!(env.dir.path().join("logs").join("VERSION").exists());

        let stored: IndexMeta = get_json(env.store.as_ref(), "/index/logs").await.unwrap();
        assert_eq!(stored.settings, json!({ "a": 1 }));
        assert_eq!(stored.version, CURRENT_VERSION);

        registry.delete("logs").await.unwrap();
        assert!(registry.get("logs").is_none());
        assert!(!env.dir.path().join("logs").exists());
        assert!(env.store.get("/index/logs").await.unwrap_err().is_not_found());

        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_validation() {
        let env = Env::new();
        let registry = env.registry().await;

        for bad in [0, MAX_SHARD_NUM + 1] {
            assert!(matches!(
                registry.create("logs", StorageKind::Disk, bad, empty(), empty()).await,
                Err(IndexError::InvalidShardCount(n)) if n == bad
            ));
        }
        assert!(matches!(
            registry.create("_logs", StorageKind::Disk, 1, empty(), empty()).await,
            Err(IndexError::InvalidName(_))
        ));

        registry
            .create("logs", StorageKind::Disk, 1, empty(), empty())
            .await
            .unwrap();
        assert!(matches!(
            registry.create("logs", StorageKind::Disk, 1, empty(), empty()).await,
            Err(IndexError::AlreadyExists(_))
        ));
        assert!(registry.delete("nope").await.unwrap_err().is_not_found());
        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_rehydrates_documents() {
        let env = Env::new();
        {
            let registry = env.registry().await;
            let index = registry
                .create("logs", StorageKind::Disk, 3, empty(), empty())
                .await
                .unwrap();
            for i in 0..30 {
                index
                    .append_document(&format!("d{i}"), &json!({ "i": i }))
                    .await
                    .unwrap();
            }
            registry.close_all().await.unwrap();
        }

        let registry = env.registry().await;
        let index = registry.get("logs").unwrap();
        assert_eq!(index.stats().doc_count, 30);
        assert_eq!(index.get_document("d7").unwrap().unwrap()["i"], 7);
        assert!(registry.unavailable().is_empty());
        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_upgrade_isolates_one_index() {
        let env = Env::new();
        {
            let registry = env.registry().await;
            for name in ["good", "bad"] {
                registry
                    .create(name, StorageKind::Disk, 1, empty(), empty())
                    .await
                    .unwrap();
            }
            registry.close_all().await.unwrap();
        }
        write_version(&env.dir.path().join("bad"), "9.9.9").unwrap();

        let registry = env.registry().await;
        assert!(registry.get("good").is_some());
        assert!(registry.get("bad").is_none());
        let unavailable = registry.unavailable();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].0, "bad");
        assert!(unavailable[0].1.contains("9.9.9"));

        // A parked index can still be dropped
        registry.delete("bad").await.unwrap();
        assert!(registry.unavailable().is_empty());
        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_or_create() {
        let env = Env::new();
        let registry = env.registry().await;

        let index = registry.get_or_create("events").await.unwrap();
        assert_eq!(index.shard_num(), env.config().shard.num);
        let again = registry.get_or_create("events").await.unwrap();
        assert!(Arc::ptr_eq(&index, &again));
        registry.close_all().await.unwrap();
        drop((index, again, registry));

        let mut config = env.config();
        config.server.auto_create_index = false;
        let registry = env.registry_with(config).await;
        let Err(err) = registry.get_or_create("other").await else {
            panic!("index created with auto-creation disabled");
        };
        assert!(err.is_not_found());
        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_usage() {
        let env = Env::new();
        let registry = env.registry().await;
        let index = registry
            .create("logs", StorageKind::Disk, 2, empty(), empty())
            .await
            .unwrap();
        for i in 0..10 {
            index
                .append_document(&format!("d{i}"), &json!({ "i": i }))
                .await
                .unwrap();
        }
        index.flush().await.unwrap();
        index.sync().await.unwrap();

        let usage = registry.usage();
        assert_eq!(usage.index_count, 1);
        assert_eq!(usage.doc_count, 10);
        assert!(usage.total_index_size_mb > 0.0);
        registry.close_all().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_all_aggregates_errors() {
        let env = Env::new();
        let mut config = env.config();
        config.shard.max_batch = 1;
        config.shard.close_timeout_ms = 0;
        let registry = env.registry_with(config).await;

        for name in ["a", "b"] {
            let index = registry
                .create(name, StorageKind::Disk, 1, empty(), empty())
                .await
                .unwrap();
            for i in 0..5000 {
                index
                    .append_document(&format!("d{i}"), &json!({}))
                    .await
                    .unwrap();
            }
        }

        let err = registry.close_all().await.unwrap_err();
        let IndexError::CloseFailed(failures) = err else {
            panic!("expected aggregated failure, got {err}");
        };
        let mut names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["a", "b"]);
        assert!(failures.iter().all(|(_, e)| matches!(e, IndexError::Timeout(_))));
    }
}
