use crate::event::BuildEvent;
use crate::store::{KvStore, MemoryStore, StoreError};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Payload as delivered by the registry for a GitHub-triggered build.
pub const QUAY_PAYLOAD: &str = r#"{
    "build_id": "6da6f88a-4f13-49f8-abe3-0ab71ea26092",
    "trigger_kind": "github",
    "name": "halyard",
    "repository": "goalbook/halyard",
    "namespace": "goalbook",
    "docker_url": "quay.io/goalbook/halyard",
    "visibility": "public",
    "docker_tags": ["master", "latest"],
    "build_name": "9978c03",
    "image_id": "c2cbdf995d089eaa5c33c9ebf37dd1e61311503f30f530edbf9c7f2f6c2be441",
    "trigger_metadata": {
        "default_branch": "master",
        "ref": "refs/heads/master",
        "commit_sha": "9978c03c1351cb24ca86a00e15894a6f3cd9af1d"
    },
    "trigger_id": "8e42ea6b-8883-42a1-b199-75cdb68ac3ec",
    "homepage": "https://quay.io/repository/goalbook/halyard/build?current=6da6f88a-4f13-49f8-abe3-0ab71ea26092"
}"#;

pub fn mock_build_event() -> BuildEvent {
    BuildEvent {
        repository: "mynamespace/repository".into(),
        namespace: "mynamespace".into(),
        name: "repository".into(),
        docker_url: "quay.io/mynamespace/repository".into(),
        docker_tags: vec!["master".into(), "latest".into()],
        homepage: "https://quay.io/repository/mynamespace/repository/build?current=some-fake-build"
            .into(),
        visibility: "public".into(),
        image_id: "c2cbdf995d089eaa5c33c9ebf37dd1e61311503f30f530edbf9c7f2f6c2be441".into(),
        build_id: "dba8aa95-4de5-4a09-8d87-1527eaa4856a".into(),
        build_name: "some-fake-build".into(),
        trigger_id: "8e42ea6b-8883-42a1-b199-75cdb68ac3ec".into(),
        trigger_kind: "github".into(),
        trigger_metadata: None,
    }
}

/// Store that records every write it is asked to perform and can be told to
/// fail the n-th call (1-based). Successful writes land in an inner memory store.
#[derive(Default)]
pub struct RecordingStore {
    calls: Mutex<Vec<(String, String)>>,
    fail_on_call: Option<usize>,
    pub data: MemoryStore,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(call: usize) -> Self {
        RecordingStore {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    /// Every attempted write, including a failed one.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl KvStore for RecordingStore {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.push((key.to_string(), value.to_string()));
            calls.len()
        };

        if self.fail_on_call == Some(call) {
            return Err(StoreError::Rejected {
                key: key.to_string(),
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "injected failure".into(),
            });
        }

        self.data.set(key, value).await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub form_value: Option<String>,
}

/// Starts a local server standing in for etcd. Every request is recorded and
/// answered with `status` and `body`.
pub async fn start_etcd_server(
    status: StatusCode,
    body: &'static str,
) -> (u16, Arc<Mutex<Vec<RecordedRequest>>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to address");
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = requests.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let recorded = recorded.clone();

            tokio::spawn(async move {
                let handler = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let recorded = recorded.clone();
                    async move {
                        let (parts, incoming) = req.into_parts();
                        let bytes = incoming.collect().await.unwrap().to_bytes();
                        let form_value = url::form_urlencoded::parse(&bytes)
                            .find(|(k, _)| k == "value")
                            .map(|(_, v)| v.into_owned());

                        recorded.lock().push(RecordedRequest {
                            method: parts.method.to_string(),
                            path: parts.uri.path().to_string(),
                            content_type: parts
                                .headers
                                .get(hyper::header::CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .map(String::from),
                            form_value,
                        });

                        let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, handler)
                    .await;
            });
        }
    });

    (port, requests)
}

/// A local port with nothing listening on it.
pub async fn unused_local_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
