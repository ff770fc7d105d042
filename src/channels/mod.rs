//! Ingestion sources and their supervisor.
//!
//! A source only moves raw message bodies. The `Ingestor` parses them and
//! registers each message in the correlation store and the task buffer. The
//! supervisor keeps a source connected, reconnecting after transport errors
//! with a fixed backoff.

pub mod amqp;
pub mod push;
pub mod stdin;

pub use amqp::AmqpSource;
pub use push::PushSource;
pub use stdin::StdinSource;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::pipeline::store::{CorrelationStore, TaskBuffer};
use crate::pipeline::types::{IncomingMessage, MessageId};

/// Raw message bodies from a connected source.
///
/// An `Err` item is a transport failure; the supervisor drops the stream and
/// reconnects. The stream ending means the source is finished for good.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, IngestError>> + Send>>;

/// A transport that produces inbound message bodies.
#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &str;

    /// Open the transport and return its message stream.
    async fn connect(&self) -> Result<MessageStream, IngestError>;

    /// Called before each reconnect attempt.
    async fn on_reconnect(&self, _attempt: u32) {}
}

// ── Ingestor ────────────────────────────────────────────────────────

/// Registers inbound messages with the pipeline.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<CorrelationStore>,
    buffer: Arc<TaskBuffer>,
}

impl Ingestor {
    pub fn new(store: Arc<CorrelationStore>, buffer: Arc<TaskBuffer>) -> Self {
        Self { store, buffer }
    }

    /// Store the message, then queue its task.
    ///
    /// The store write comes first so a drained task always finds its entry.
    pub async fn ingest(&self, message: IncomingMessage) {
        let task = message.task();
        debug!(
            messageid = message.id,
            filters = message.filters.len(),
            "Message ingested"
        );
        self.store.put(message).await;
        self.buffer.push(task);
    }

    /// Parse a raw body and ingest it.
    pub async fn ingest_raw(&self, body: &[u8]) -> Result<MessageId, IngestError> {
        let message: IncomingMessage = serde_json::from_slice(body)?;
        let id = message.id;
        self.ingest(message).await;
        Ok(id)
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Reconnect behavior for a supervised source.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Fixed wait before every reconnect.
    pub reconnect_backoff: Duration,
    /// Give up after this many reconnects. `None` retries forever.
    pub max_reconnects: Option<u32>,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(5),
            max_reconnects: None,
        }
    }
}

/// Run `source` until its stream ends cleanly, reconnecting on failures.
pub fn spawn_ingest_supervisor(
    source: Arc<dyn IngestSource>,
    ingestor: Ingestor,
    policy: SupervisorPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = source.name().to_string();
        let mut reconnects: u32 = 0;

        loop {
            match source.connect().await {
                Ok(stream) => {
                    info!(source = %name, "Ingestion source connected");
                    match consume(&name, stream, &ingestor).await {
                        Ok(()) => {
                            info!(source = %name, "Ingestion source finished");
                            return;
                        }
                        Err(e) => warn!(source = %name, error = %e, "Ingestion source failed"),
                    }
                }
                Err(e) => warn!(source = %name, error = %e, "Ingestion source connect failed"),
            }

            if let Some(max) = policy.max_reconnects
                && reconnects >= max
            {
                error!(source = %name, reconnects, "Giving up on ingestion source");
                return;
            }

            reconnects += 1;
            tokio::time::sleep(policy.reconnect_backoff).await;
            info!(source = %name, attempt = reconnects, "Reconnecting ingestion source");
            source.on_reconnect(reconnects).await;
        }
    })
}

/// Feed every body from `stream` to the ingestor.
///
/// Malformed bodies are logged and dropped; transport errors end the stream.
async fn consume(
    name: &str,
    mut stream: MessageStream,
    ingestor: &Ingestor,
) -> Result<(), IngestError> {
    while let Some(item) = stream.next().await {
        let body = item?;
        if let Err(e) = ingestor.ingest_raw(&body).await {
            error!(source = name, error = %e, "Dropping malformed message");
        }
    }
    Ok(())
}
