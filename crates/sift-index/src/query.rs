//! Delete-by-query: resolve matching ids with a query engine, then delete
//! each one through the index.

use crate::error::{IndexError, Result};
use crate::index::Index;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use tracing::info;

/// Resolves a query to the ids of matching documents
#[async_trait]
pub trait QueryResolver: Send + Sync {
    async fn resolve(&self, index: &Index, query: &Value) -> Result<Vec<String>>;
}

/// Resolver for `{"ids": {"values": [...]}}` queries over committed
/// documents
#[derive(Clone, Copy, Debug, Default)]
pub struct IdsResolver;

#[async_trait]
impl QueryResolver for IdsResolver {
    async fn resolve(&self, index: &Index, query: &Value) -> Result<Vec<String>> {
        let values = query
            .pointer("/ids/values")
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::InvalidQuery("expected ids.values array".into()))?;

        let mut matched = Vec::with_capacity(values.len());
        for value in values {
            let doc_id = value
                .as_str()
                .ok_or_else(|| IndexError::InvalidQuery(format!("id {value} is not a string")))?;
            if index.get_document(doc_id)?.is_some() {
                matched.push(doc_id.to_string());
            }
        }
        Ok(matched)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retries {
    pub bulk: u64,
    pub search: u64,
}

/// Delete-by-query outcome in the conventional response shape
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteByQueryResponse {
    /// Milliseconds spent
    pub took: u64,
    pub timed_out: bool,
    pub total: u64,
    pub deleted: u64,
    pub batches: u64,
    pub version_conflicts: u64,
    pub noops: u64,
    /// Ids that could not be deleted
    pub failures: Vec<String>,
    pub retries: Retries,
    pub throttled_millis: u64,
    pub requests_per_second: f64,
    pub throttled_until_millis: u64,
}

/// Delete every document matching `query`, with at most `concurrency`
/// deletes in flight. Individual failures are reported in the response;
/// only resolution errors and non-partial failures fail the call.
pub async fn delete_by_query(
    index: &Index,
    resolver: &dyn QueryResolver,
    query: &Value,
    concurrency: usize,
) -> Result<DeleteByQueryResponse> {
    let start = Instant::now();
    let mut doc_ids = resolver.resolve(index, query).await?;
    doc_ids.sort_unstable();
    doc_ids.dedup();
    let total = doc_ids.len() as u64;

    let failures = match index.delete_documents(&doc_ids, concurrency).await {
        Ok(_) => Vec::new(),
        Err(IndexError::PartialFailure { failed_ids, .. }) => failed_ids,
        Err(e) => return Err(e),
    };
    let deleted = total - failures.len() as u64;

    info!(
        "Delete by query on {}: total={}, deleted={}, failed={}",
        index.name(),
        total,
        deleted,
        failures.len()
    );
    Ok(DeleteByQueryResponse {
        took: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        timed_out: false,
        total,
        deleted,
        batches: u64::from(total > 0),
        version_conflicts: 0,
        noops: 0,
        failures,
        retries: Retries::default(),
        throttled_millis: 0,
        requests_per_second: -1.0,
        throttled_until_millis: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::route;
    use crate::index::tests::Fixture;
    use serde_json::json;

    struct Fixed(Vec<String>);

    #[async_trait]
    impl QueryResolver for Fixed {
        async fn resolve(&self, _index: &Index, _query: &Value) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_by_ids_query() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 2).await;
        for id in ["a", "b", "c"] {
            index.append_document(id, &json!({})).await.unwrap();
        }
        index.flush().await.unwrap();

        let query = json!({ "ids": { "values": ["a", "c", "missing"] } });
        let response = delete_by_query(&index, &IdsResolver, &query, 4).await.unwrap();
        assert_eq!(response.total, 2);
        assert_eq!(response.deleted, 2);
        assert!(response.failures.is_empty());

        index.flush().await.unwrap();
        assert!(index.get_document("a").unwrap().is_none());
        assert!(index.get_document("b").unwrap().is_some());

        let bad = delete_by_query(&index, &IdsResolver, &json!({ "match_all": {} }), 4).await;
        assert!(matches!(bad, Err(IndexError::InvalidQuery(_))));
        index.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failures_are_listed() {
        let fixture = Fixture::new();
        let index = fixture.index("logs", 3).await;
        let ids: Vec<String> = (0..60).map(|i| format!("doc-{i}")).collect();
        for id in &ids {
            index.append_document(id, &json!({})).await.unwrap();
        }
        index.flush().await.unwrap();
        index.shard(1).unwrap().close().await.unwrap();

        let response = delete_by_query(&index, &Fixed(ids.clone()), &json!({}), 8)
            .await
            .unwrap();
        let expected = ids.iter().filter(|id| route(id, 3) == 1).count() as u64;
        assert_eq!(response.total, 60);
        assert_eq!(response.failures.len() as u64, expected);
        assert_eq!(response.deleted, response.total - expected);
        assert!(response.failures.iter().all(|id| route(id, 3) == 1));
        index.close().await.unwrap();
    }

    #[test]
    fn test_response_shape() {
        let response = DeleteByQueryResponse {
            took: 3,
            timed_out: false,
            total: 2,
            deleted: 1,
            batches: 1,
            version_conflicts: 0,
            noops: 0,
            failures: vec!["x".into()],
            retries: Retries::default(),
            throttled_millis: 0,
            requests_per_second: -1.0,
            throttled_until_millis: 0,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["requests_per_second"], -1.0);
        assert_eq!(value["retries"], json!({ "bulk": 0, "search": 0 }));
        assert_eq!(value["failures"], json!(["x"]));
        assert_eq!(value["took"], 3);
    }
}
