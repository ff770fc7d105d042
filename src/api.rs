//! HTTP API: synchronous classification and health.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::pipeline::processor::FilterProcessor;
use crate::pipeline::prompts::PromptSource;
use crate::pipeline::scheduler::BatchScheduler;
use crate::pipeline::store::{CorrelationStore, TaskBuffer};
use crate::pipeline::types::ClassificationTask;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<FilterProcessor>,
    pub prompts: PromptSource,
    pub store: Arc<CorrelationStore>,
    pub buffer: Arc<TaskBuffer>,
    /// Reported by `/health` when the batch pipeline is running.
    pub scheduler: Option<Arc<BatchScheduler>>,
}

/// Build the router with the `/process` and `/health` routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/process", post(process))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error wrapper that maps pipeline errors onto HTTP responses.
struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::Prompts(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "llm-filter",
        "buffered": state.buffer.len(),
        "inflight": state.store.len().await,
        "scheduler": state.scheduler.as_ref().map(|s| s.state()),
    }))
}

// ── Synchronous classification ──────────────────────────────────────────

/// Classify a list of messages right away, bypassing the batch pipeline.
async fn process(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let Value::Array(items) = body else {
        warn!("Rejected /process body that is not a list");
        return Err(PipelineError::BadRequest("expected a list of messages".into()).into());
    };

    let tasks = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<ClassificationTask>(item)
                .map_err(|e| PipelineError::BadRequest(format!("message {index}: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!(count = tasks.len(), "Received messages for synchronous processing");

    let prompts = state.prompts.load().await.map_err(|e| {
        error!(error = %e, "Prompt templates unavailable");
        PipelineError::Prompts(e)
    })?;

    let processed = state.processor.classify_all(&tasks, &prompts).await;
    Ok((StatusCode::OK, Json(processed)))
}
