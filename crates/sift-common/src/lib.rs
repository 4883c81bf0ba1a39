//! Sift Common - Shared types and utilities
//!
//! This crate provides the configuration tree, common error definitions,
//! validated names and the time-ordered ID generator used across all Sift
//! components.

pub mod config;
pub mod error;
pub mod ider;
pub mod record_log;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use ider::Node;
pub use record_log::{RecordLog, RecordLogConfig};
pub use types::*;
