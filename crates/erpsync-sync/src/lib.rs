//! Sync orchestration: entity registry, the generic driver, range mode,
//! delete propagation and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use erpsync_core::{ConfigError, ErrorKind, MappingError, SyncFailure};
use erpsync_source::{ErpClient, FetchError};
use erpsync_store::{PgWarehouse, WriteError};
use serde_json::json;
use thiserror::Error;

pub mod config;
pub mod deletes;
pub mod engine;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use config::SyncConfig;
pub use engine::{EngineSettings, SyncEngine};
pub use registry::{DeleteFeedConfig, EntityRegistry, EntitySummary, MAX_LOOKBACK_HOURS};
pub use scheduler::build_scheduler;

pub const CRATE_NAME: &str = "erpsync-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("run exceeded its {0:?} time budget")]
    Timeout(Duration),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Fetch(e) if e.is_timeout() => ErrorKind::Timeout,
            SyncError::Fetch(_) => ErrorKind::Fetch,
            SyncError::Write(e) if e.is_timeout() => ErrorKind::Timeout,
            SyncError::Write(_) => ErrorKind::Write,
            SyncError::Mapping(_) => ErrorKind::Coercion,
            SyncError::Config(_) => ErrorKind::Configuration,
            SyncError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    pub fn into_failure(self) -> SyncFailure {
        let failure = SyncFailure::new(self.kind(), self.to_string());
        match &self {
            SyncError::Fetch(e) => {
                let failure = failure.with_status(e.status_code());
                match e.details() {
                    Some(details) => failure.with_details(details),
                    None => failure,
                }
            }
            SyncError::Write(WriteError::Database { table, source }) => {
                failure.with_details(json!({ "table": table, "cause": source.to_string() }))
            }
            _ => failure,
        }
    }
}

/// Wires the HTTP client, Postgres pool and registry from config.
pub async fn engine_from_config(config: &SyncConfig) -> Result<SyncEngine> {
    ensure!(
        !config.erp_api_url.is_empty(),
        "ERP_API_URL is not set; it is the base URL of the ERP API"
    );
    let registry = EntityRegistry::load(&config.entities_file)?;
    let client = ErpClient::new(config.erp_client_config())?;
    let warehouse = PgWarehouse::connect(
        &config.database_url,
        config.db_max_connections,
        config.statement_timeout(),
    )
    .await
    .context("opening destination warehouse")?;
    Ok(SyncEngine::new(
        Arc::new(client),
        Arc::new(warehouse),
        Arc::new(registry),
        config.engine_settings(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failures_keep_status_and_body() {
        let err = SyncError::from(FetchError::HttpStatus {
            status: 502,
            url: "https://erp.local/x".into(),
            body: "gateway down".into(),
        });
        let failure = err.into_failure();
        assert_eq!(failure.error_kind, ErrorKind::Fetch);
        assert_eq!(failure.status_code, Some(502));
        assert_eq!(failure.details, Some(json!("gateway down")));
    }

    #[test]
    fn timeouts_are_classified() {
        let err = SyncError::from(FetchError::Timeout {
            url: "https://erp.local/x".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            SyncError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn config_errors_map_to_configuration() {
        let failure = SyncError::from(ConfigError::UnknownEntity("x".into())).into_failure();
        assert_eq!(failure.error_kind, ErrorKind::Configuration);
        assert_eq!(failure.error, "unknown entity `x`");
        assert_eq!(failure.status_code, None);
    }
}
