//! Inference backend trait.

use async_trait::async_trait;

use crate::error::InferenceError;

/// A single-shot text generation backend.
///
/// Implementations send one prompt, ask the model to answer in JSON, and
/// return the raw response text. Parsing and retries belong to the gateway.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Backend name for logs and errors.
    fn name(&self) -> &str;

    /// Model the backend generates with.
    fn model_name(&self) -> &str;

    /// Generate a JSON-constrained completion for `prompt`.
    async fn generate_json(&self, prompt: &str) -> Result<String, InferenceError>;
}
