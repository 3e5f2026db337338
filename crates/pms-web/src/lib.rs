//! Axum trigger surface for PMS syncs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use pms_sync::{
    pipeline_from_env, resolve_window, ConfigError, InvocationResponse, InvocationStatus,
    SyncError, SyncPipeline,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pms-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    date: Option<String>,
    end_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/{integration}", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PMS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let state = AppState::new(Arc::new(pipeline_from_env()?));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync triggers");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let integrations = state.pipeline.config().names().collect::<Vec<_>>();
    Json(json!({ "status": "ok", "integrations": integrations })).into_response()
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Path(integration): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let today = Utc::now().date_naive();
    let window = match resolve_window(query.date.as_deref(), query.end_date.as_deref(), today) {
        Ok(window) => window,
        Err(err) => return invocation(StatusCode::BAD_REQUEST, error_response(err.to_string())),
    };

    let result = state.pipeline.run_integration(&integration, window).await;
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(SyncError::Config(ConfigError::UnknownIntegration(_) | ConfigError::NoAdapter(_))) => {
            StatusCode::NOT_FOUND
        }
        Err(SyncError::Config(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        Err(SyncError::Fetch { .. }) => StatusCode::BAD_GATEWAY,
    };
    invocation(status, InvocationResponse::from_result(result))
}

fn error_response(message: String) -> InvocationResponse {
    InvocationResponse {
        status: InvocationStatus::Error,
        message,
        summary: None,
    }
}

fn invocation(status: StatusCode, body: InvocationResponse) -> Response {
    (status, Json(body)).into_response()
}
