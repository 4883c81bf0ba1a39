//! Sift Index - index lifecycle, sharding and write-ahead durability
//!
//! - [`Registry`]: persisted directory of indices, rehydrated and upgraded
//!   at startup
//! - [`Index`]: routes documents to shards by a hash of their id
//! - [`Shard`]: bounded write queue, WAL, worker pool and sync timer
//! - [`UpgradePipeline`]: ordered on-disk migrations
//! - [`delete_by_query`]: resolve-then-delete with per-id failure reporting

pub mod error;
pub mod index;
pub mod meta;
pub mod query;
pub mod registry;
pub mod segment;
pub mod shard;
pub mod upgrade;
pub mod wal;

pub use error::{IndexError, Result};
pub use index::{Index, route};
pub use meta::{IndexMeta, IndexStats, Usage};
pub use query::{DeleteByQueryResponse, IdsResolver, QueryResolver, Retries, delete_by_query};
pub use registry::Registry;
pub use segment::{MemorySegment, PreparedOp, RedbSegment, SegmentStore};
pub use shard::{Shard, ShardOptions};
pub use upgrade::{CURRENT_VERSION, UpgradePipeline};
pub use wal::{DocOp, ShardWal, WalEntry};
