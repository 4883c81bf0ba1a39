//! Metadata key layout.
//!
//! ```text
//! /instance_id            persistent identity of this deployment
//! /index/<name>           index definition (JSON)
//! /<domain>/<path...>     control records owned by other subsystems
//! ```

/// Key holding the deployment's instance identifier
pub const INSTANCE_ID: &str = "/instance_id";

/// Prefix under which every index definition lives
pub const INDEX_PREFIX: &str = "/index/";

/// Key of one index definition
#[must_use]
pub fn index(name: &str) -> String {
    format!("{INDEX_PREFIX}{name}")
}

/// Recover the index name from a definition key
#[must_use]
pub fn index_name(key: &str) -> Option<&str> {
    key.strip_prefix(INDEX_PREFIX).filter(|name| !name.is_empty())
}

/// Key of a control record, e.g. `control("usage", "last_report")`
#[must_use]
pub fn control(domain: &str, path: &str) -> String {
    format!(
        "/{}/{}",
        domain.trim_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_keys() {
        assert_eq!(index("logs"), "/index/logs");
        assert_eq!(index_name("/index/logs"), Some("logs"));
        assert_eq!(index_name("/index/"), None);
        assert_eq!(index_name("/instance_id"), None);
    }

    #[test]
    fn test_control_keys() {
        assert_eq!(control("usage", "last_report"), "/usage/last_report");
        assert_eq!(control("/usage/", "/a/b"), "/usage/a/b");
    }
}
