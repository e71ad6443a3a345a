pub mod config;
pub mod errors;
pub mod event;
pub mod metrics_defs;
pub mod projection;
pub mod service;
pub mod store;

#[cfg(test)]
mod testutils;

use errors::BuildHookError;
use service::BuildHookService;
use shared::http::run_http_service;

/// Runs the build hook receiver until the listener fails.
///
/// The store client is created once here and shared by every request.
pub async fn run(config: config::Config) -> Result<(), BuildHookError> {
    let store = store::create_store(&config.store)?;
    tracing::info!(store = store.name(), "Store client ready");

    let service = BuildHookService::new(store, config.security_key, config.max_body_bytes);
    run_http_service(&config.listener.host, config.listener.port, service).await
}
