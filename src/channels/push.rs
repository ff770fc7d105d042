//! Push source: messages POSTed to `/ingest` over HTTP.
//!
//! The HTTP handler validates each message and forwards its body through an
//! unbounded channel; `connect()` hands out the receiving side as the source
//! stream. Validation happens up front so callers get a 400 for bad input,
//! while the ingestor stays the single place that registers messages.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::channels::{IngestSource, MessageStream};
use crate::error::IngestError;
use crate::pipeline::types::IncomingMessage;

const SOURCE_NAME: &str = "http-push";

/// Handler state (cloneable).
#[derive(Clone)]
struct PushState {
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// HTTP push ingestion source.
pub struct PushSource {
    state: PushState,
    /// Receiving side of the channel, consumed once in `connect()`.
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl PushSource {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            state: PushState { incoming_tx },
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    /// Router with the `POST /ingest` endpoint. Merge into the main app.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ingest", post(ingest_handler))
            .with_state(self.state.clone())
    }
}

impl Default for PushSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestSource for PushSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn connect(&self) -> Result<MessageStream, IngestError> {
        let rx = self
            .incoming_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| IngestError::AlreadyConnected {
                name: SOURCE_NAME.to_string(),
            })?;
        Ok(Box::pin(UnboundedReceiverStream::new(rx).map(Ok::<_, IngestError>)))
    }
}

/// Accepts one message object or a list of them.
async fn ingest_handler(
    State(state): State<PushState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let items = match body {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "expected a message object or a list of messages" })),
            );
        }
    };

    // Validate everything before forwarding anything.
    for (index, item) in items.iter().enumerate() {
        if let Err(e) = IncomingMessage::deserialize(item) {
            warn!(index, error = %e, "Rejected malformed pushed message");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("message {index}: {e}") })),
            );
        }
    }

    let accepted = items.len();
    for item in items {
        if state.incoming_tx.send(item.to_string().into_bytes()).is_err() {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "ingestion is not running" })),
            );
        }
    }

    debug!(accepted, "Pushed messages accepted");
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted })))
}
