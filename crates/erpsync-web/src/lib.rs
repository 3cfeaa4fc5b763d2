//! JSON endpoints that trigger syncs on demand.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use erpsync_core::filters::parse_start_date;
use erpsync_core::{ConfigError, Period, SyncFailure, SyncFilters};
use erpsync_sync::SyncEngine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "erpsync-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FetchQuery {
    period: Option<String>,
    start_date: Option<String>,
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
    start_date: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/entities", get(entities_handler))
        .route("/fetchdata/{entity}", get(fetch_handler))
        .route("/fetchdata/{entity}/range", get(range_handler))
        .route("/fetchdeleterec", get(delete_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(engine: Arc<SyncEngine>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "http server listening");
    axum::serve(listener, app(AppState::new(engine)))
        .await
        .context("serving http")?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "service": "erpsync",
        "version": env!("CARGO_PKG_VERSION"),
        "entities": state.engine.registry().entities.len(),
        "delete_feed": state.engine.registry().delete_feed.is_some(),
    }))
    .into_response()
}

async fn entities_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.registry().summaries()).into_response()
}

async fn fetch_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Query(query): Query<FetchQuery>,
) -> Response {
    if let Err(err) = state.engine.registry().get(&entity) {
        return config_error(err);
    }
    let filters = if query.all {
        if query.period.is_some() || query.start_date.is_some() {
            return config_error(ConfigError::InvalidArguments(
                "`all` cannot be combined with period or startDate".into(),
            ));
        }
        SyncFilters::all()
    } else {
        match SyncFilters::parse(query.period.as_deref(), query.start_date.as_deref()) {
            Ok(filters) => filters,
            Err(err) => return config_error(err),
        }
    };

    let result = state.engine.run_sync(&entity, filters).await;
    if result.success {
        return Json(result).into_response();
    }
    let failure = result.failure.clone();
    failure_response(format!("Failed to sync {entity}"), failure.as_ref())
}

async fn range_handler(
    State(state): State<Arc<AppState>>,
    Path(entity): Path<String>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let parsed = (|| -> Result<(Period, Period, Option<chrono::NaiveDate>), ConfigError> {
        let start = query
            .start
            .as_deref()
            .ok_or_else(|| ConfigError::InvalidArguments("`start` period is required".into()))?
            .parse::<Period>()?;
        let end = match query.end.as_deref().filter(|e| !e.is_empty()) {
            Some(end) => end.parse::<Period>()?,
            None => start,
        };
        let start_date = query
            .start_date
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(parse_start_date)
            .transpose()?;
        Ok((start, end, start_date))
    })();
    let (start, end, start_date) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => return config_error(err),
    };

    match state.engine.run_range(&entity, start, end, start_date).await {
        Ok(summary) if summary.success => Json(summary).into_response(),
        Ok(summary) => (StatusCode::INTERNAL_SERVER_ERROR, Json(summary)).into_response(),
        Err(erpsync_sync::SyncError::Config(err)) => config_error(err),
        Err(err) => failure_response(
            format!("Failed to sync {entity}"),
            Some(&err.into_failure()),
        ),
    }
}

async fn delete_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = state.engine.run_delete_sync().await;
    if result.success {
        return Json(result).into_response();
    }
    let failure = result.failure.clone();
    failure_response("Failed to sync deleted records".to_string(), failure.as_ref())
}

fn failure_response(message: String, failure: Option<&SyncFailure>) -> Response {
    let status = failure
        .and_then(|f| f.status_code)
        .and_then(|code| StatusCode::from_u16(code).ok())
        .filter(|s| s.is_client_error() || s.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        message,
        error: failure.map(|f| f.error.clone()),
        details: failure.and_then(|f| f.details.clone()),
    };
    (status, Json(body)).into_response()
}

fn config_error(err: ConfigError) -> Response {
    let status = match err {
        ConfigError::UnknownEntity(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    let body = ErrorBody {
        message: "Invalid request".to_string(),
        error: Some(err.to_string()),
        details: None,
    };
    (status, Json(body)).into_response()
}
