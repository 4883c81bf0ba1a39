//! Embedded transactional backend backed by redb.
//!
//! All keys live in one table. Every write is its own write transaction and
//! is durable once `commit` returns.

use crate::error::{MetaStoreError, MetaStoreResult, check_key};
use crate::store::MetaStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const METADATA: TableDefinition<&str, &[u8]> = TableDefinition::new("metadata");

/// Persistent metadata store backed by redb.
pub struct RedbStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(METADATA)?;
        }
        write_txn.commit()?;

        info!("Opened redb metadata store at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            db: RwLock::new(Some(db)),
        })
    }

    /// Path of the database file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> MetaStoreResult<T>) -> MetaStoreResult<T> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(MetaStoreError::Closed)?;
        f(db)
    }

    fn get_sync(&self, key: &str) -> MetaStoreResult<Vec<u8>> {
        check_key(key)?;
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(METADATA)?;
            let value = table.get(key)?.map(|v| v.value().to_vec());
            value.ok_or_else(|| MetaStoreError::KeyNotFound(key.to_string()))
        })
    }

    fn set_sync(&self, key: &str, value: &[u8]) -> MetaStoreResult<()> {
        check_key(key)?;
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(METADATA)?;
                table.insert(key, value)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn delete_sync(&self, key: &str) -> MetaStoreResult<()> {
        check_key(key)?;
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(METADATA)?;
                table.remove(key)?;
            }
            write_txn.commit()?;
            Ok(())
        })
    }

    fn list_sync(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(METADATA)?;
            // The range iterator is consumed lazily: we stop at the first key
            // past the prefix or once the page is full.
            let mut matches = Vec::new();
            let mut skipped = 0usize;
            for entry in table.range(prefix..)? {
                let (k, v) = entry?;
                let key = k.value();
                if !key.starts_with(prefix) {
                    break;
                }
                if skipped < offset {
                    skipped += 1;
                    continue;
                }
                matches.push((key.to_string(), v.value().to_vec()));
                if limit != 0 && matches.len() >= limit {
                    break;
                }
            }
            Ok(matches)
        })
    }
}

#[async_trait]
impl MetaStore for RedbStore {
    async fn get(&self, key: &str) -> MetaStoreResult<Vec<u8>> {
        self.get_sync(key)
    }

    async fn set(&self, key: &str, value: &[u8]) -> MetaStoreResult<()> {
        self.set_sync(key, value)
    }

    async fn delete(&self, key: &str) -> MetaStoreResult<()> {
        self.delete_sync(key)
    }

    async fn list(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        self.list_sync(prefix, offset, limit)
    }

    async fn close(&self) -> MetaStoreResult<()> {
        if self.db.write().take().is_some() {
            debug!("Closed redb metadata store at {:?}", self.path);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redb"
    }
}
