//! AMQP source: consumes message bodies from a RabbitMQ queue.
//!
//! The queue is declared durable and consumed with auto-ack, so a body is
//! acknowledged as soon as the broker hands it over. A dropped connection
//! surfaces as a stream error and the supervisor reconnects.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channels::{IngestSource, MessageStream};
use crate::config::AmqpConfig;
use crate::error::IngestError;

const SOURCE_NAME: &str = "amqp";
const CONSUMER_TAG: &str = "llm-filter";

/// RabbitMQ queue consumer.
pub struct AmqpSource {
    config: AmqpConfig,
    /// Live connection, kept so the consumer outlives `connect()`.
    connection: Mutex<Option<Connection>>,
}

impl AmqpSource {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    fn connect_failed(&self, e: lapin::Error) -> IngestError {
        IngestError::ConnectFailed {
            name: SOURCE_NAME.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl IngestSource for AmqpSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn connect(&self) -> Result<MessageStream, IngestError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| self.connect_failed(e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| self.connect_failed(e))?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.connect_failed(e))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.connect_failed(e))?;

        info!(queue = %self.config.queue, "Consuming AMQP queue");
        *self.connection.lock().await = Some(connection);

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| delivery.data)
                .map_err(|e| IngestError::Disconnected {
                    name: SOURCE_NAME.to_string(),
                    reason: e.to_string(),
                })
        });
        Ok(Box::pin(stream))
    }

    async fn on_reconnect(&self, attempt: u32) {
        // Drop the broken connection before opening a new one.
        if let Some(connection) = self.connection.lock().await.take() {
            debug!(attempt, "Closing stale AMQP connection");
            let _ = connection.close(0, "reconnecting").await;
        }
    }
}
