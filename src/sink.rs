//! Downstream sink: delivers enriched result batches to the core service.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::SinkConfig;
use crate::error::DispatchError;
use crate::pipeline::types::EnrichedResult;

/// Accepts one batch of enriched results per scheduler tick.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Sink name for logs.
    fn name(&self) -> &str;

    /// Deliver a batch. Called at most once per batch; no retries.
    async fn dispatch(&self, batch: &[EnrichedResult]) -> Result<(), DispatchError>;
}

/// POSTs each batch as a JSON array to a REST endpoint.
pub struct HttpSink {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            timeout: config.timeout,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ResultSink for HttpSink {
    fn name(&self) -> &str {
        "core-rest"
    }

    async fn dispatch(&self, batch: &[EnrichedResult]) -> Result<(), DispatchError> {
        debug!(endpoint = %self.endpoint, count = batch.len(), "Dispatching batch");

        let res = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(batch)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        endpoint: self.endpoint.clone(),
                        timeout: self.timeout,
                    }
                } else {
                    DispatchError::RequestFailed {
                        endpoint: self.endpoint.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        if !res.status().is_success() {
            return Err(DispatchError::Rejected {
                endpoint: self.endpoint.clone(),
                status: res.status().as_u16(),
            });
        }

        info!(endpoint = %self.endpoint, count = batch.len(), "Batch delivered");
        Ok(())
    }
}
