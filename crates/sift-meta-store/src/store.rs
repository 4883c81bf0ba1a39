//! The metadata store contract and backend selection.

use crate::error::{MetaStoreError, MetaStoreResult};
use crate::etcd::EtcdStore;
use crate::lsm::{LsmConfig, LsmStore};
use crate::redb_store::RedbStore;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sift_common::Config;
use sift_common::config::{MetadataStorage, ServerMode};
use std::sync::Arc;
use tracing::info;

/// Uniform key-value contract implemented by every backend.
///
/// Keys are hierarchical text paths. `list` returns entries in lexicographic
/// key order. Writes are visible to subsequent reads on the same node; any
/// cross-node visibility is whatever the backing coordination store provides.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Fetch a value, failing with `KeyNotFound` when absent
    async fn get(&self, key: &str) -> MetaStoreResult<Vec<u8>>;

    /// Insert or overwrite a value
    async fn set(&self, key: &str, value: &[u8]) -> MetaStoreResult<()>;

    /// Remove a key; removing an absent key succeeds
    async fn delete(&self, key: &str) -> MetaStoreResult<()>;

    /// Page through keys starting with `prefix`, skipping `offset` matches and
    /// returning at most `limit` of them (`0` means no limit)
    async fn list(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>>;

    /// Release the backend. Later calls fail with `Closed`.
    async fn close(&self) -> MetaStoreResult<()>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Open the single metadata backend selected by deployment mode and
/// storage configuration.
pub fn open(config: &Config) -> MetaStoreResult<Arc<dyn MetaStore>> {
    let store: Arc<dyn MetaStore> = match config.server.mode {
        ServerMode::Cluster => Arc::new(EtcdStore::new(&config.metadata.etcd)?),
        ServerMode::Standalone => {
            let data_path = &config.server.data_path;
            match config.metadata.storage {
                MetadataStorage::Redb => {
                    Arc::new(RedbStore::open(data_path.join("_metadata.redb"))?)
                }
                MetadataStorage::Lsm => Arc::new(LsmStore::open(LsmConfig::with_data_dir(
                    data_path.join("_metadata.lsm"),
                ))?),
            }
        }
    };
    info!(
        "Metadata store opened: backend={}, mode={:?}",
        store.backend(),
        config.server.mode
    );
    Ok(store)
}

/// Read and decode a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn MetaStore,
    key: &str,
) -> MetaStoreResult<T> {
    let bytes = store.get(key).await?;
    serde_json::from_slice(&bytes).map_err(MetaStoreError::from)
}

/// Encode and write a JSON value
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn MetaStore,
    key: &str,
    value: &T,
) -> MetaStoreResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes).await
}

/// Apply offset/limit paging to an ordered iterator of matches
pub(crate) fn paginate<I>(iter: I, offset: usize, limit: usize) -> Vec<(String, Vec<u8>)>
where
    I: Iterator<Item = (String, Vec<u8>)>,
{
    let iter = iter.skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share.

    use super::*;

    pub async fn set_get_delete(store: &dyn MetaStore) {
        store.set("/test/foo", b"bar").await.unwrap();
        assert_eq!(store.get("/test/foo").await.unwrap(), b"bar");

        store.set("/test/foo", b"baz").await.unwrap();
        assert_eq!(store.get("/test/foo").await.unwrap(), b"baz");

        store.delete("/test/foo").await.unwrap();
        let err = store.get("/test/foo").await.unwrap_err();
        assert!(err.is_not_found(), "{err}");

        // Deleting an absent key is not an error
        store.delete("/test/foo").await.unwrap();
    }

    pub async fn empty_key_rejected(store: &dyn MetaStore) {
        assert!(matches!(
            store.set("", b"x").await,
            Err(MetaStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.delete("").await,
            Err(MetaStoreError::InvalidKey(_))
        ));
        assert!(matches!(
            store.get("").await,
            Err(MetaStoreError::InvalidKey(_))
        ));
    }

    pub async fn list_prefix_order_and_paging(store: &dyn MetaStore) {
        for key in ["/idx/c", "/idx/a", "/idx/b", "/idz/a", "/id", "/idx/d"] {
            store.set(key, key.as_bytes()).await.unwrap();
        }

        let all = store.list("/idx/", 0, 0).await.unwrap();
        let keys: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/idx/a", "/idx/b", "/idx/c", "/idx/d"]);
        assert_eq!(all[0].1, b"/idx/a");

        let mut previous: Vec<(String, Vec<u8>)> = Vec::new();
        for n in 1..=5 {
            let page = store.list("/idx/", 0, n).await.unwrap();
            assert!(page.len() <= n);
            assert!(page.iter().all(|(k, _)| k.starts_with("/idx/")));
            assert!(previous.iter().all(|entry| page.contains(entry)));
            previous = page;
        }

        let page = store.list("/idx/", 1, 2).await.unwrap();
        let keys: Vec<&str> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/idx/b", "/idx/c"]);

        assert!(store.list("/nothing/", 0, 10).await.unwrap().is_empty());
    }

    pub async fn closed_store_rejects(store: &dyn MetaStore) {
        store.close().await.unwrap();
        assert!(matches!(
            store.get("/test/foo").await,
            Err(MetaStoreError::Closed)
        ));
        assert!(matches!(
            store.set("/test/foo", b"x").await,
            Err(MetaStoreError::Closed)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_paginate() {
        let items = (0..10).map(|i| (format!("k{i}"), vec![i]));
        assert_eq!(paginate(items.clone(), 0, 0).len(), 10);
        assert_eq!(paginate(items.clone(), 8, 0).len(), 2);
        assert_eq!(paginate(items.clone(), 2, 3)[0].0, "k2");
        assert!(paginate(items, 20, 5).is_empty());
    }

    #[tokio::test]
    async fn test_open_selects_backend() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.server.data_path = dir.path().to_path_buf();

        let store = open(&config).unwrap();
        assert_eq!(store.backend(), "redb");
        store.close().await.unwrap();

        config.metadata.storage = MetadataStorage::Lsm;
        let store = open(&config).unwrap();
        assert_eq!(store.backend(), "lsm");
        store.close().await.unwrap();

        config.server.mode = ServerMode::Cluster;
        config.metadata.etcd.endpoints = vec!["http://127.0.0.1:2379".into()];
        let store = open(&config).unwrap();
        assert_eq!(store.backend(), "etcd");
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("meta.redb")).unwrap();

        set_json(&store, "/doc", &vec![1u32, 2, 3]).await.unwrap();
        let value: Vec<u32> = get_json(&store, "/doc").await.unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        store.set("/bad", b"not json").await.unwrap();
        assert!(matches!(
            get_json::<Vec<u32>>(&store, "/bad").await,
            Err(MetaStoreError::Json(_))
        ));
    }
}
