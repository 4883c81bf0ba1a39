//! Sift Metadata Store - pluggable key-value persistence
//!
//! One uniform contract (`get`/`set`/`delete`/`list`/`close`) over three
//! interchangeable backends:
//! - [`RedbStore`]: embedded transactional B-tree file (standalone)
//! - [`LsmStore`]: embedded WAL + memtable + snapshots (standalone)
//! - [`EtcdStore`]: shared coordination store under a key prefix (cluster)
//!
//! Exactly one backend is active per process, chosen by [`open`].

mod error;
pub mod etcd;
pub mod instance;
pub mod keys;
pub mod lsm;
pub mod redb_store;
mod store;

pub use error::{MetaStoreError, MetaStoreResult};
pub use etcd::EtcdStore;
pub use instance::instance_id;
pub use lsm::{LsmConfig, LsmStore};
pub use redb_store::RedbStore;
pub use store::{MetaStore, get_json, open, set_json};
