//! Embedded log-structured backend
//!
//! Writes go to a checksummed write-ahead log first, then into an ordered
//! in-memory table. A background thread periodically writes the table to a
//! checksummed snapshot file and truncates the log behind it. Opening the
//! store loads the newest snapshot and replays the log tail.
//!
//! ```text
//! <data_dir>/
//!   metadata.wal
//!   snapshots/
//!     meta_<lsn>.snapshot
//! ```

mod memtable;
mod store;

pub use memtable::{Memtable, MemtableConfig};
pub use store::{LsmConfig, LsmStats, LsmStore};
