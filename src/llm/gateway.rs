//! Retry-wrapped inference gateway and the single-resource slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use super::provider::InferenceBackend;
use crate::error::InferenceError;

/// Turns a prompt into parsed JSON, retrying failed attempts.
///
/// A backend error or unparseable output counts as a failed attempt.
/// Attempts are spaced by a fixed backoff; there is no jitter and no growth.
#[derive(Clone)]
pub struct InferenceGateway {
    backend: Arc<dyn InferenceBackend>,
    max_retries: u32,
    backoff: Duration,
}

impl InferenceGateway {
    pub fn new(backend: Arc<dyn InferenceBackend>, max_retries: u32, backoff: Duration) -> Self {
        Self {
            backend,
            max_retries: max_retries.max(1),
            backoff,
        }
    }

    /// Send `prompt` until a response parses as JSON or attempts run out.
    pub async fn call(&self, prompt: &str) -> Result<serde_json::Value, InferenceError> {
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            match self.attempt(prompt).await {
                Ok(value) => {
                    debug!(attempt, "Inference call succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max = self.max_retries,
                        backend = self.backend.name(),
                        error = %e,
                        "Inference attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(InferenceError::Exhausted {
            attempts: self.max_retries,
            last: last_error,
        })
    }

    async fn attempt(&self, prompt: &str) -> Result<serde_json::Value, InferenceError> {
        let raw = self.backend.generate_json(prompt).await?;
        Ok(serde_json::from_str(strip_code_fence(&raw))?)
    }
}

/// Capacity-1 semaphore guarding the shared inference runtime.
///
/// Held for a whole processor invocation, by the batch scheduler and the
/// synchronous endpoint alike.
#[derive(Clone)]
pub struct InferenceSlot {
    semaphore: Arc<Semaphore>,
}

impl InferenceSlot {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for exclusive access to the inference runtime.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        // The semaphore is never closed.
        match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("inference slot semaphore closed"),
        }
    }

    /// Whether someone currently holds the slot.
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for InferenceSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwrap a reply the model put in a markdown code fence.
///
/// Anything else is returned trimmed and parsed as is, so prose around the
/// JSON still fails the attempt.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    else {
        return trimmed;
    };
    body.strip_prefix("json").unwrap_or(body).trim()
}
