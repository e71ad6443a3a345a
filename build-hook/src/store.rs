//! Clients for the external key/value store that build events are projected into.
//!
//! The store is used as a plain durable map: every write is an unconditional,
//! permanent overwrite and nothing is ever read back by the receiver.
use crate::config::StoreConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store rejected write to {key}: {status} {message}")]
    Rejected {
        key: String,
        status: StatusCode,
        message: String,
    },

    #[error("invalid store URL: {0}")]
    InvalidUrl(String),

    #[error("invalid key {0}: relative path segments are not allowed")]
    InvalidKey(String),
}

/// A single shared handle is created at startup and used concurrently by all
/// requests, so implementations must be safe for independent concurrent calls.
#[async_trait]
pub trait KvStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub fn create_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>, StoreError> {
    match config {
        StoreConfig::Etcd { url, timeout_secs } => Ok(Arc::new(EtcdStore::new(
            url,
            Duration::from_secs(*timeout_secs),
        )?)),
        StoreConfig::Memory => {
            tracing::warn!("Using the in-memory store. Writes are lost on restart.");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[derive(Deserialize)]
struct EtcdErrorBody {
    message: String,
    #[serde(default)]
    cause: Option<String>,
}

/// etcd v2 keys API client.
pub struct EtcdStore {
    client: reqwest::Client,
    endpoint: Url,
}

impl EtcdStore {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, StoreError> {
        let endpoint = Url::parse(endpoint).map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(endpoint.to_string()));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(EtcdStore { client, endpoint })
    }

    // Each `/`-separated part of the key becomes one percent-encoded path segment.
    // `.` and `..` would be resolved away by the URL, so they are refused.
    fn key_url(&self, key: &str) -> Result<Url, StoreError> {
        let segments = key.trim_start_matches('/').split('/');
        if segments.clone().any(|segment| segment == "." || segment == "..") {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidUrl(self.endpoint.to_string()))?
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    fn name(&self) -> &'static str {
        "etcd"
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let url = self.key_url(key)?;

        let response = self
            .client
            .put(url)
            .form(&[("value", value)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                let message = match serde_json::from_str::<EtcdErrorBody>(&text) {
                    Ok(EtcdErrorBody {
                        message,
                        cause: Some(cause),
                    }) => format!("{message} ({cause})"),
                    Ok(EtcdErrorBody { message, .. }) => message,
                    Err(_) => text,
                };

                Err(StoreError::Rejected {
                    key: key.to_string(),
                    status,
                    message,
                })
            }
        }
    }
}

/// Ordered in-process map. Useful for dry runs; never fails.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.read().clone()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        tracing::debug!(key, value_len = value.len(), "memory store write");
        self.data.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{RecordedRequest, start_etcd_server, unused_local_port};

    #[tokio::test]
    async fn test_etcd_set() {
        let (port, requests) = start_etcd_server(StatusCode::CREATED, "").await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(5))
            .unwrap();

        store
            .set("containers/quay.io/org/app/latest/image", "img1")
            .await
            .unwrap();

        let requests = requests.lock().clone();
        assert_eq!(
            requests,
            vec![RecordedRequest {
                method: "PUT".into(),
                path: "/v2/keys/containers/quay.io/org/app/latest/image".into(),
                content_type: Some("application/x-www-form-urlencoded".into()),
                form_value: Some("img1".into()),
            }]
        );
    }

    #[tokio::test]
    async fn test_etcd_set_json_value() {
        let (port, requests) = start_etcd_server(StatusCode::OK, "").await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}/"), Duration::from_secs(5))
            .unwrap();

        let value = r#"{"build_id":"b1","docker_tags":["a b","c&d"]}"#;
        store
            .set("containers/registry.example:5000/app/v1/details", value)
            .await
            .unwrap();

        let requests = requests.lock().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].path,
            "/v2/keys/containers/registry.example:5000/app/v1/details"
        );
        assert_eq!(requests[0].form_value.as_deref(), Some(value));
    }

    #[tokio::test]
    async fn test_etcd_endpoint_with_path() {
        let (port, requests) = start_etcd_server(StatusCode::OK, "").await;
        let store = EtcdStore::new(
            &format!("http://127.0.0.1:{port}/etcd/"),
            Duration::from_secs(5),
        )
        .unwrap();

        store.set("containers/a/b/build", "b1").await.unwrap();
        assert_eq!(
            requests.lock()[0].path,
            "/etcd/v2/keys/containers/a/b/build"
        );
    }

    #[tokio::test]
    async fn test_etcd_rejected_write() {
        let body = r#"{"errorCode":102,"message":"Not a file","cause":"/containers/a","index":7}"#;
        let (port, _requests) = start_etcd_server(StatusCode::FORBIDDEN, body).await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(5))
            .unwrap();

        let err = store.set("containers/a", "x").await.unwrap_err();
        match err {
            StoreError::Rejected {
                key,
                status,
                message,
            } => {
                assert_eq!(key, "containers/a");
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(message, "Not a file (/containers/a)");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_etcd_rejected_write_plain_body() {
        let (port, _requests) =
            start_etcd_server(StatusCode::INTERNAL_SERVER_ERROR, "raft: stopped").await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(5))
            .unwrap();

        let err = store.set("containers/a", "x").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Rejected { ref message, .. } if message == "raft: stopped"
        ));
    }

    #[tokio::test]
    async fn test_etcd_relative_key_refused() {
        let (port, requests) = start_etcd_server(StatusCode::OK, "").await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(5))
            .unwrap();

        for key in ["containers/quay.io/app/../image", "containers/./app/latest/build"] {
            let err = store.set(key, "x").await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(ref k) if k == key));
        }
        assert!(requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_etcd_unreachable() {
        let port = unused_local_port().await;
        let store = EtcdStore::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(2))
            .unwrap();

        let err = store.set("containers/a", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
    }

    #[test]
    fn test_etcd_invalid_endpoint() {
        assert!(matches!(
            EtcdStore::new("not a url", Duration::from_secs(1)),
            Err(StoreError::InvalidUrl(_))
        ));
        assert!(matches!(
            EtcdStore::new("mailto:etcd@example.com", Duration::from_secs(1)),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();
        store.set("a", "3").await.unwrap();

        assert_eq!(store.get("a").as_deref(), Some("3"));
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_create_store() {
        let store = create_store(&StoreConfig::Memory).unwrap();
        assert_eq!(store.name(), "memory");

        let store = create_store(&StoreConfig::Etcd {
            url: "http://127.0.0.1:2379".into(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(store.name(), "etcd");
    }
}
