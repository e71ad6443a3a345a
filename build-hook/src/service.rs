use crate::errors::BuildHookError;
use crate::event::decode_event_lenient;
use crate::metrics_defs::{EVENTS_RECEIVED, REQUEST_DURATION};
use crate::projection::{ProjectionError, project};
use crate::store::KvStore;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use shared::http::{make_boxed_error_response, make_json_response};
use shared::{counter, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub type HookBody = BoxBody<Bytes, BuildHookError>;

const HEALTHCHECK_PATH: &str = "/healthcheck";
const SUCCESS_SEGMENT: &str = "success";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    HealthCheck,
    BuildSuccess,
    MethodNotAllowed,
    NotFound,
}

impl Route {
    fn as_str(&self) -> &'static str {
        match self {
            Route::HealthCheck => "healthcheck",
            Route::BuildSuccess => "build_success",
            Route::MethodNotAllowed => "method_not_allowed",
            Route::NotFound => "not_found",
        }
    }
}

#[derive(Serialize)]
struct StatusEnvelope<'a> {
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct HookState {
    store: Arc<dyn KvStore>,
    security_key: String,
    max_body_bytes: usize,
}

/// Receives build-success hooks on `/{security_key}/success` and answers
/// health checks on `/healthcheck`.
#[derive(Clone)]
pub struct BuildHookService {
    state: Arc<HookState>,
}

impl BuildHookService {
    pub fn new(store: Arc<dyn KvStore>, security_key: String, max_body_bytes: usize) -> Self {
        Self {
            state: Arc::new(HookState {
                store,
                security_key,
                max_body_bytes,
            }),
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<HookBody>
    where
        B: Body + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let method = req.method().clone();
        let path = self.redacted_path(req.uri().path());
        let route = self.route(&method, req.uri().path());

        let response = match route {
            Route::HealthCheck => json_response(
                StatusCode::OK,
                &StatusEnvelope {
                    status: "healthy",
                    error: None,
                },
            ),
            Route::BuildSuccess => self.handle_build_success(req).await,
            Route::MethodNotAllowed => make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED),
            Route::NotFound => make_boxed_error_response(StatusCode::NOT_FOUND),
        };

        let status = response.status();
        let elapsed = start.elapsed();
        histogram!(REQUEST_DURATION, "route" => route.as_str(), "status" => status.as_str().to_owned())
            .record(elapsed.as_secs_f64());
        tracing::info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Handled request"
        );

        response
    }

    fn route(&self, method: &Method, path: &str) -> Route {
        if path == HEALTHCHECK_PATH {
            return match *method {
                Method::GET => Route::HealthCheck,
                _ => Route::MethodNotAllowed,
            };
        }

        match path.strip_prefix('/').and_then(|p| p.split_once('/')) {
            Some((key, SUCCESS_SEGMENT)) if key == self.state.security_key => match *method {
                Method::POST => Route::BuildSuccess,
                _ => Route::MethodNotAllowed,
            },
            _ => Route::NotFound,
        }
    }

    // Keeps the shared secret out of logs.
    fn redacted_path(&self, path: &str) -> String {
        match path.strip_prefix('/').and_then(|p| p.split_once('/')) {
            Some((key, rest)) if key == self.state.security_key => format!("/[redacted]/{rest}"),
            _ => path.to_string(),
        }
    }

    async fn handle_build_success<B>(&self, req: Request<B>) -> Response<HookBody>
    where
        B: Body + Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());

        let body = match Limited::new(body, self.state.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                tracing::warn!(limit = self.state.max_body_bytes, "Request body too large");
                return make_boxed_error_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                // Treated like an undecodable body
                tracing::warn!(error = %e, "Failed to read request body");
                Bytes::new()
            }
        };

        let event = decode_event_lenient(&parts.method, content_type, &body);
        counter!(EVENTS_RECEIVED).increment(1);
        tracing::info!(
            repository = %event.repository,
            docker_url = %event.docker_url,
            tags = ?event.docker_tags,
            build_id = %event.build_id,
            trigger_kind = %event.trigger_kind,
            "Received build event"
        );

        match project(self.state.store.as_ref(), &event).await {
            Ok(report) => {
                tracing::info!(
                    groups = report.groups,
                    writes = report.writes,
                    "Projected build event"
                );
                json_response(
                    StatusCode::OK,
                    &StatusEnvelope {
                        status: "ok",
                        error: None,
                    },
                )
            }
            Err(e) => {
                tracing::error!(error = %e, docker_url = %event.docker_url, "Projection failed");
                let status = match e {
                    ProjectionError::InvalidPrefix(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    ProjectionError::Serialize(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    ProjectionError::Write { .. } => StatusCode::BAD_GATEWAY,
                };
                json_response(
                    status,
                    &StatusEnvelope {
                        status: "error",
                        error: Some(e.to_string()),
                    },
                )
            }
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<HookBody> {
    match serde_json::to_vec(value) {
        Ok(json) => make_json_response(status, json),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize response");
            make_boxed_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

impl Service<Request<Incoming>> for BuildHookService {
    type Response = Response<HookBody>;
    type Error = BuildHookError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}
