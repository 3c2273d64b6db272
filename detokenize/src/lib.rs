//! BigQuery remote function that detokenizes vault tokens in bulk.

pub mod config;
pub mod detokenizer;
pub mod errors;
pub mod metrics_defs;
pub mod protocol;
pub mod replies;
pub mod service;
pub mod submitter;
pub mod trace;
pub mod vault;

#[cfg(test)]
mod testutils;

use crate::config::{BearerSource, Config};
use crate::detokenizer::Detokenizer;
use crate::errors::DetokenizeError;
use crate::service::DetokenizeService;
use batchflow::bearer::{BearerSupplier, FileBearerGenerator, RefreshingBearer, StaticBearer};
use batchflow::sender::ReqwestSender;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

pub async fn run(config: Config) -> Result<(), DetokenizeError> {
    config.validate()?;

    let bearer: Arc<dyn BearerSupplier> = match &config.vault.bearer {
        BearerSource::Static { token } => Arc::new(StaticBearer::new(token.as_str())),
        BearerSource::File { path } => {
            Arc::new(RefreshingBearer::new(FileBearerGenerator::new(path)))
        }
    };
    let detokenizer = Detokenizer::new(
        Arc::new(ReqwestSender::new()),
        bearer,
        &config.vault,
        config.retry.backoff(),
    )?;

    let gcp_project_id = config.gcp_project_id.clone().filter(|p| !p.is_empty());
    if gcp_project_id.is_none() {
        tracing::warn!(
            "GCP project ID is not configured: request logs will not include the GCP trace ID"
        );
    }

    let detokenizer = Arc::new(detokenizer);
    detokenizer.check_bearer().await;

    let ready = detokenizer.clone();
    let service = DetokenizeService::new(detokenizer, gcp_project_id);
    let admin_service = AdminService::<_, DetokenizeError>::new(move || ready.is_ready());

    tracing::info!(
        vault_url = %config.vault.url,
        max_batch_size = config.vault.max_batch_size,
        "Starting detokenize service"
    );
    let service_task = run_http_service(&config.listener.host, config.listener.port, service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );
    tokio::try_join!(service_task, admin_task)?;

    Ok(())
}
