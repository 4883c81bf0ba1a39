//! A named, sharded collection of JSON documents.

use crate::error::{IndexError, Result};
use crate::meta::{IndexMeta, IndexStats};
use crate::shard::{Shard, ShardOptions, shard_dir};
use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use serde_json::Value;
use sift_common::{Config, Node, StorageKind};
use sift_meta_store::{MetaStore, keys, set_json};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

/// Shard that owns `doc_id` in an index of `shard_num` shards
#[must_use]
pub fn route(doc_id: &str, shard_num: u32) -> u32 {
    let shard_num = u64::from(shard_num.max(1));
    u32::try_from(xxh64(doc_id.as_bytes(), 0) % shard_num).unwrap_or(0)
}

/// An open index
pub struct Index {
    meta: RwLock<IndexMeta>,
    /// Serializes definition updates so concurrent edits do not overwrite
    /// each other in the store
    update_lock: tokio::sync::Mutex<()>,
    dir: PathBuf,
    shards: Vec<Arc<Shard>>,
    store: Arc<dyn MetaStore>,
    node: Arc<Node>,
}

impl Index {
    /// Open every shard of `meta` under `dir`
    pub(crate) fn open(
        meta: IndexMeta,
        dir: PathBuf,
        store: Arc<dyn MetaStore>,
        node: Arc<Node>,
        config: &Config,
    ) -> Result<Self> {
        let options = ShardOptions::from_config(config, meta.storage_kind);
        let mut shards = Vec::with_capacity(meta.shard_num as usize);
        for id in 0..meta.shard_num {
            let shard = Shard::open(&meta.name, id, &shard_dir(&dir, id), options.clone())?;
            shards.push(Arc::new(shard));
        }

        info!(
            "Opened index {}: shards={}, storage={}",
            meta.name, meta.shard_num, meta.storage_kind
        );
        Ok(Self {
            meta: RwLock::new(meta),
            update_lock: tokio::sync::Mutex::new(()),
            dir,
            shards,
            store,
            node,
        })
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.meta.read().name.clone()
    }

    /// Snapshot of the current definition
    #[must_use]
    pub fn meta(&self) -> IndexMeta {
        self.meta.read().clone()
    }

    #[must_use]
    pub fn shard_num(&self) -> u32 {
        self.meta.read().shard_num
    }

    #[must_use]
    pub fn storage_kind(&self) -> StorageKind {
        self.meta.read().storage_kind
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn shard(&self, id: u32) -> Option<&Arc<Shard>> {
        self.shards.get(id as usize)
    }

    fn shard_for(&self, doc_id: &str) -> &Shard {
        // route() stays below the number of opened shards
        let id = route(doc_id, u32::try_from(self.shards.len()).unwrap_or(u32::MAX));
        &self.shards[id as usize]
    }

    /// Queue an add or update of `doc_id`. Returns once queued.
    pub async fn append_document(&self, doc_id: &str, source: &Value) -> Result<u64> {
        if doc_id.is_empty() {
            return Err(IndexError::InvalidDocument("document id must not be empty".into()));
        }
        if !source.is_object() {
            return Err(IndexError::InvalidDocument(format!(
                "document {doc_id} must be a JSON object"
            )));
        }
        let payload = Bytes::from(serde_json::to_vec(source)?);
        self.shard_for(doc_id).put(doc_id, payload).await
    }

    /// Queue a new document under a freshly generated id
    pub async fn add_document(&self, source: &Value) -> Result<String> {
        let doc_id = self.node.generate();
        self.append_document(&doc_id, source).await?;
        Ok(doc_id)
    }

    /// Queue the deletion of one document
    pub async fn delete_document(&self, doc_id: &str) -> Result<u64> {
        self.shard_for(doc_id).delete(doc_id).await
    }

    /// Delete `doc_ids` with at most `concurrency` deletes in flight.
    ///
    /// Repeated ids are deleted once. Deletes are independent: on failure
    /// every other id is still deleted and `PartialFailure` lists exactly the
    /// ids that were not.
    pub async fn delete_documents(&self, doc_ids: &[String], concurrency: usize) -> Result<usize> {
        let unique: BTreeSet<&str> = doc_ids.iter().map(String::as_str).collect();
        let total = unique.len();
        let outcomes: Vec<(&str, Result<u64>)> = stream::iter(unique)
            .map(|doc_id| async move { (doc_id, self.delete_document(doc_id).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut deleted = 0;
        let mut failed_ids = Vec::new();
        for (doc_id, outcome) in outcomes {
            match outcome {
                Ok(_) => deleted += 1,
                Err(e) => {
                    debug!("Delete of {} failed: {}", doc_id, e);
                    failed_ids.push(doc_id.to_string());
                }
            }
        }

        if failed_ids.is_empty() {
            Ok(deleted)
        } else {
            failed_ids.sort();
            warn!(
                "Index {}: {} of {} deletes failed",
                self.name(),
                failed_ids.len(),
                total
            );
            Err(IndexError::PartialFailure {
                failed_ids,
                deleted,
            })
        }
    }

    /// Committed source of a document
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Value>> {
        self.shard_for(doc_id)
            .get(doc_id)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(IndexError::from))
            .transpose()
    }

    /// Wait until every queued operation is committed
    pub async fn flush(&self) -> Result<()> {
        futures::future::try_join_all(self.shards.iter().map(|s| s.flush())).await?;
        Ok(())
    }

    /// Force durability on every shard now
    pub async fn sync(&self) -> Result<()> {
        futures::future::try_join_all(self.shards.iter().map(|s| s.sync())).await?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            shard_num: self.shard_num(),
            ..IndexStats::default()
        };
        for shard in &self.shards {
            stats.doc_count += shard.doc_count();
            stats.storage_size += shard.storage_size();
            stats.wal_size += shard.wal_size();
        }
        stats
    }

    /// Replace the index settings; persisted before taking effect
    pub async fn update_settings(&self, settings: Value) -> Result<()> {
        self.update_meta(|meta| meta.settings = settings).await
    }

    /// Replace the index mappings; persisted before taking effect
    pub async fn update_mappings(&self, mappings: Value) -> Result<()> {
        self.update_meta(|meta| meta.mappings = mappings).await
    }

    async fn update_meta(&self, edit: impl FnOnce(&mut IndexMeta)) -> Result<()> {
        let _guard = self.update_lock.lock().await;
        let mut updated = self.meta();
        edit(&mut updated);
        updated.touch();
        set_json(self.store.as_ref(), &keys::index(&updated.name), &updated).await?;
        *self.meta.write() = updated;
        Ok(())
    }

    /// Close every shard; all shards are attempted even when some fail
    pub async fn close(&self) -> Result<()> {
        let name = self.name();
        let results = futures::future::join_all(self.shards.iter().map(|s| s.close())).await;

        let mut errors: Vec<(String, IndexError)> = results
            .into_iter()
            .enumerate()
            .filter_map(|(id, r)| r.err().map(|e| (format!("{name}/{id}"), e)))
            .collect();
        match errors.len() {
            0 => {
                info!("Closed index {}", name);
                Ok(())
            }
            1 => Err(errors.remove(0).1),
            _ => Err(IndexError::CloseFailed(errors)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::Rng;
    use serde_json::json;
    use sift_meta_store::{RedbStore, get_json};
    use std::collections::HashSet;
    use tempfile::{TempDir, tempdir};

    pub(crate) struct Fixture {
        pub dir: TempDir,
        pub store: Arc<dyn MetaStore>,
        pub node: Arc<Node>,
        pub config: Config,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempdir().unwrap();
            let store: Arc<dyn MetaStore> =
                Arc::new(RedbStore::open(dir.path().join("_metadata.redb")).unwrap());
            let mut config = Config::default();
            config.server.data_path = dir.path().to_path_buf();
            config.wal.sync_interval_ms = 50;
            Self {
                dir,
                store,
                node: Arc::new(Node::new(1).unwrap()),
                config,
            }
        }

        pub async fn index(&self, name: &str, shard_num: u32) -> Index {
            let meta = IndexMeta::new(name, StorageKind::Disk, shard_num);
            set_json(self.store.as_ref(), &keys::index(name), &meta)
                .await
                .unwrap();
            Index::open(
                meta,
                self.dir.path().join(name),
                Arc::clone(&self.store),
                Arc::clone(&self.node),
                &self.config,
            )
            .unwrap()
        }
    }

    fn random_ids(n: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        let mut ids = HashSet::with_capacity(n);
        while ids.len() < n {
            ids.insert(format!("{:016x}", rng.r#gen::<u64>()));
        }
        ids.into_iter().collect()
    }

    #[test]
    fn test_route_is_stable_and_in_range() {
        for shard_num in [1, 3, 4, 1024] {
            for i in 0..200 {
                let id = format!("doc-{i}");
                let shard = route(&id, shard_num);
                assert!(shard < shard_num);
                assert_eq!(shard, route(&id, shard_num));
            }
        }
        assert_eq!(route("anything", 1), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_then_delete_thousand_documents() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 4).await;
        let ids = random_ids(1000);

        for (n, id) in ids.iter().enumerate() {
            index.append_document(id, &json!({ "n": n })).await.unwrap();
        }
        index.flush().await.unwrap();

        assert_eq!(index.stats().doc_count, 1000);
        for id in &ids {
            let doc = index.get_document(id).unwrap().unwrap();
            assert_eq!(doc["_id"], id.as_str());
        }
        // Every shard took part
        for id in 0..4 {
            assert!(index.shard(id).unwrap().doc_count() > 0);
        }

        let deleted = index.delete_documents(&ids, 8).await.unwrap();
        assert_eq!(deleted, 1000);
        index.flush().await.unwrap();
        assert_eq!(index.stats().doc_count, 0);
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_partial_failure_reports_closed_shard_ids() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 4).await;
        let ids = random_ids(200);
        for id in &ids {
            index.append_document(id, &json!({})).await.unwrap();
        }
        index.flush().await.unwrap();

        index.shard(2).unwrap().close().await.unwrap();
        let mut expected: Vec<String> = ids.iter().filter(|id| route(id, 4) == 2).cloned().collect();
        expected.sort();
        assert!(!expected.is_empty());

        let err = index.delete_documents(&ids, 8).await.unwrap_err();
        let IndexError::PartialFailure {
            failed_ids,
            deleted,
        } = err
        else {
            panic!("expected partial failure, got {err}");
        };
        assert_eq!(failed_ids, expected);
        assert_eq!(deleted, ids.len() - expected.len());

        index.flush().await.unwrap();
        for id in &ids {
            let present = index.get_document(id).unwrap().is_some();
            assert_eq!(present, route(id, 4) == 2, "{id}");
        }
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_repeated_ids_are_deleted_once() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 2).await;
        index.append_document("a", &json!({})).await.unwrap();
        index.append_document("b", &json!({})).await.unwrap();
        index.flush().await.unwrap();

        let ids: Vec<String> = ["a", "a", "b", "a"].iter().map(|s| (*s).to_string()).collect();
        assert_eq!(index.delete_documents(&ids, 4).await.unwrap(), 2);
        index.flush().await.unwrap();
        assert_eq!(index.stats().doc_count, 0);
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rejects_invalid_documents() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 1).await;

        assert!(matches!(
            index.append_document("", &json!({})).await,
            Err(IndexError::InvalidDocument(_))
        ));
        assert!(matches!(
            index.append_document("a", &json!([1, 2])).await,
            Err(IndexError::InvalidDocument(_))
        ));
        assert!(index.delete_document("missing").await.unwrap_err().is_not_found());
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_document_generates_id() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 2).await;

        let id = index.add_document(&json!({ "msg": "hello" })).await.unwrap();
        assert_eq!(Node::node_of(&id), Some(1));
        index.flush().await.unwrap();
        assert_eq!(index.get_document(&id).unwrap().unwrap()["msg"], "hello");
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_settings_persists() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 1).await;

        index
            .update_settings(json!({ "refresh_interval": "1s" }))
            .await
            .unwrap();
        index
            .update_mappings(json!({ "properties": { "msg": { "type": "text" } } }))
            .await
            .unwrap();

        let stored: IndexMeta = get_json(fixture.store.as_ref(), &keys::index("logs"))
            .await
            .unwrap();
        assert_eq!(stored.settings["refresh_interval"], "1s");
        assert_eq!(stored.mappings["properties"]["msg"]["type"], "text");
        assert_eq!(stored, index.meta());
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_fails_on_closed_store() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 1).await;
        let before = index.meta();

        fixture.store.close().await.unwrap();
        assert!(index.update_settings(json!({ "x": 1 })).await.is_err());
        // Memory is untouched when persistence fails
        assert_eq!(index.meta(), before);
        index.close().await.unwrap();
    }
}
