//! Core type definitions for Sift
//!
//! Validated index names and the storage kinds an index can be created with.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of shards a single index may be split into
pub const MAX_SHARD_NUM: u32 = 1024;

/// Name of an index
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct IndexName(String);

impl IndexName {
    /// Create a new index name (validates naming rules)
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the index name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), NameError> {
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.len() > 255 {
            return Err(NameError::TooLong);
        }

        // Leading '_' and '.' are reserved for internal files like _metadata.redb
        let first = name.chars().next().unwrap_or('_');
        if first == '_' || first == '.' {
            return Err(NameError::ReservedPrefix(first));
        }

        for c in name.chars() {
            if c == '/' || c == '\\' || c.is_control() || c.is_whitespace() {
                return Err(NameError::InvalidChar(c));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexName({:?})", self.0)
    }
}

impl AsRef<str> for IndexName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating an index name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,
    #[error("name must be at most 255 bytes")]
    TooLong,
    #[error("name must not start with '{0}'")]
    ReservedPrefix(char),
    #[error("name contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Where an index keeps its segment data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Segment files on local disk
    #[default]
    Disk,
    /// Segments held in memory; only the WAL survives a restart
    Memory,
}

impl StorageKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disk => "disk",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "disk" => Ok(Self::Disk),
            "memory" => Ok(Self::Memory),
            other => Err(crate::Error::configuration(format!(
                "unknown storage kind: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_index_names() {
        assert!(IndexName::new("logs").is_ok());
        assert!(IndexName::new("logs-2024.01").is_ok());
        assert_eq!(IndexName::new("logs").unwrap().as_str(), "logs");
    }

    #[test]
    fn test_invalid_index_names() {
        assert_eq!(IndexName::new(""), Err(NameError::Empty));
        assert_eq!(IndexName::new("_meta"), Err(NameError::ReservedPrefix('_')));
        assert_eq!(IndexName::new(".hidden"), Err(NameError::ReservedPrefix('.')));
        assert_eq!(IndexName::new("a/b"), Err(NameError::InvalidChar('/')));
        assert_eq!(IndexName::new("a b"), Err(NameError::InvalidChar(' ')));
        assert_eq!(IndexName::new("x".repeat(256)), Err(NameError::TooLong));
    }

    #[test]
    fn test_storage_kind_parse() {
        assert_eq!("disk".parse::<StorageKind>().unwrap(), StorageKind::Disk);
        assert_eq!("Memory".parse::<StorageKind>().unwrap(), StorageKind::Memory);
        assert_eq!("".parse::<StorageKind>().unwrap(), StorageKind::Disk);
        assert!("s3".parse::<StorageKind>().is_err());
    }
}
