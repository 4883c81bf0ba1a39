//! Coordination-store backend (etcd v3 over its JSON gateway).
//!
//! Every key is stored under `<prefix>/metadata`, and that namespace is
//! stripped again from listed keys. Endpoints are tried in order until one
//! answers, and each operation is bounded by the configured deadline.
//! Construction performs no network I/O; the auth token is fetched on
//! first use.

use crate::error::{MetaStoreError, MetaStoreResult, check_key};
use crate::store::{MetaStore, paginate};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use sift_common::config::EtcdConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Namespace appended to the configured prefix
const METADATA_NAMESPACE: &str = "/metadata";

#[derive(Debug, Default, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Default, Deserialize)]
struct Ignored {}

/// Metadata store shared by every node of a cluster
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
    namespace: String,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl EtcdStore {
    /// Build a client for the configured endpoints
    pub fn new(config: &EtcdConfig) -> MetaStoreResult<Self> {
        if config.endpoints.is_empty() {
            return Err(MetaStoreError::Configuration(
                "etcd requires at least one endpoint".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| MetaStoreError::Configuration(e.to_string()))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            (Some(user), None) => Some((user.clone(), String::new())),
            _ => None,
        };

        let endpoints: Vec<String> = config
            .endpoints
            .iter()
            .map(|e| normalize_endpoint(e))
            .collect();
        let namespace = format!(
            "{}{}",
            config.prefix.trim_end_matches('/'),
            METADATA_NAMESPACE
        );

        info!(
            "etcd metadata store: endpoints={:?}, namespace={}",
            endpoints, namespace
        );
        Ok(Self {
            client,
            endpoints,
            namespace,
            credentials,
            token: RwLock::new(None),
            timeout: config.timeout(),
            closed: AtomicBool::new(false),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn check_open(&self) -> MetaStoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetaStoreError::Closed);
        }
        Ok(())
    }

    /// Issue one gateway call under the operation deadline
    async fn call<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        body: Value,
    ) -> MetaStoreResult<T> {
        self.check_open()?;
        match tokio::time::timeout(self.timeout, self.call_authenticated(path, &body)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("etcd {} exceeded deadline of {:?}", path, self.timeout);
                Err(MetaStoreError::Timeout)
            }
        }
    }

    async fn call_authenticated<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        body: &Value,
    ) -> MetaStoreResult<T> {
        let token = self.token().await?;
        match self.post(path, body, token.as_deref()).await {
            Err(MetaStoreError::Backend(msg)) if token.is_some() && is_auth_failure(&msg) => {
                // Expired token: fetch a fresh one and retry once
                debug!("etcd token rejected, re-authenticating");
                *self.token.write() = None;
                let token = self.token().await?;
                self.post(path, body, token.as_deref()).await
            }
            other => other,
        }
    }

    async fn token(&self) -> MetaStoreResult<Option<String>> {
        let Some((name, password)) = &self.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.token.read().clone() {
            return Ok(Some(token));
        }

        let body = json!({ "name": name, "password": password });
        let auth: AuthResponse = self.post("/v3/auth/authenticate", &body, None).await?;
        if auth.token.is_empty() {
            return Err(MetaStoreError::Backend("etcd returned an empty auth token".into()));
        }
        *self.token.write() = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    /// POST to each endpoint in turn until one answers
    async fn post<T: DeserializeOwned + Default>(
        &self,
        path: &str,
        body: &Value,
        token: Option<&str>,
    ) -> MetaStoreResult<T> {
        let mut last_err = MetaStoreError::Unavailable("no endpoint tried".into());

        for endpoint in &self.endpoints {
            let mut request = self.client.post(format!("{endpoint}{path}")).json(body);
            if let Some(token) = token {
                request = request.header("Authorization", token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    debug!("etcd endpoint {} failed: {}", endpoint, e);
                    last_err = if e.is_timeout() {
                        MetaStoreError::Timeout
                    } else {
                        MetaStoreError::Unavailable(format!("{endpoint}: {e}"))
                    };
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                debug!("etcd endpoint {} returned {}: {}", endpoint, status, text);
                last_err = MetaStoreError::Unavailable(format!("{endpoint}: {status} {text}"));
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(MetaStoreError::Backend(format!("{status}: {text}")));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| MetaStoreError::Unavailable(format!("{endpoint}: {e}")))?;
            if bytes.is_empty() {
                return Ok(T::default());
            }
            return serde_json::from_slice(&bytes).map_err(MetaStoreError::from);
        }

        Err(last_err)
    }

    async fn range(
        &self,
        key: &str,
        range_end: Option<&[u8]>,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let mut body = json!({
            "key": BASE64.encode(key),
            "sort_order": "ASCEND",
            "sort_target": "KEY",
        });
        if let Some(end) = range_end {
            body["range_end"] = Value::String(BASE64.encode(end));
        }
        if limit > 0 {
            body["limit"] = json!(limit);
        }

        let response: RangeResponse = self.call("/v3/kv/range", body).await?;
        response
            .kvs
            .into_iter()
            .map(|kv| {
                let key = decode_text(&kv.key)?;
                let value = BASE64
                    .decode(kv.value.as_bytes())
                    .map_err(|e| MetaStoreError::Corrupt(format!("etcd value for {key}: {e}")))?;
                Ok((key, value))
            })
            .collect()
    }
}

/// Add a scheme when missing and drop trailing slashes
fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range to the end of the keyspace
    vec![0]
}

fn decode_text(encoded: &str) -> MetaStoreResult<String> {
    let bytes = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| MetaStoreError::Corrupt(format!("etcd key: {e}")))?;
    String::from_utf8(bytes).map_err(|e| MetaStoreError::Corrupt(format!("etcd key: {e}")))
}

fn is_auth_failure(msg: &str) -> bool {
    msg.starts_with("401") || msg.contains("invalid auth token")
}

#[async_trait]
impl MetaStore for EtcdStore {
    async fn get(&self, key: &str) -> MetaStoreResult<Vec<u8>> {
        check_key(key)?;
        self.range(&self.full_key(key), None, 1)
            .await?
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| MetaStoreError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> MetaStoreResult<()> {
        check_key(key)?;
        let body = json!({
            "key": BASE64.encode(self.full_key(key)),
            "value": BASE64.encode(value),
        });
        let _: Ignored = self.call("/v3/kv/put", body).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> MetaStoreResult<()> {
        check_key(key)?;
        let body = json!({ "key": BASE64.encode(self.full_key(key)) });
        let _: Ignored = self.call("/v3/kv/deleterange", body).await?;
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
        let full_prefix = self.full_key(prefix);
        let end = prefix_end(&full_prefix);

        // The gateway has no offset, so fetch the skipped entries too
        let fetch = if limit == 0 { 0 } else { offset + limit };
        let entries = self.range(&full_prefix, Some(end.as_slice()), fetch).await?;

        let namespace = self.namespace.as_str();
        let stripped = entries.into_iter().filter_map(|(key, value)| {
            key.strip_prefix(namespace)
                .filter(|k| k.starts_with(prefix))
                .map(|k| (k.to_string(), value))
        });
        Ok(paginate(stripped, offset, limit))
    }

    async fn close(&self) -> MetaStoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed etcd metadata store ({})", self.namespace);
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "etcd"
    }
}
