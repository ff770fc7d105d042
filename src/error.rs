//! Error types for the filter service.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read prompt template {path}: {source}")]
    PromptRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Prompt template {path} has no {marker} marker")]
    PromptMarkerMissing { path: String, marker: String },
}

/// Inference backend and gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Backend {backend} request failed: {reason}")]
    RequestFailed { backend: String, reason: String },

    #[error("Backend {backend} returned status {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("Response is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Backend {backend} not ready after {tries} tries")]
    NotReady { backend: String, tries: u32 },

    #[error("All {attempts} inference attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Ingestion adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed ingest message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Source {name} failed to connect: {reason}")]
    ConnectFailed { name: String, reason: String },

    #[error("Source {name} disconnected: {reason}")]
    Disconnected { name: String, reason: String },

    #[error("Source {name} stream was already taken")]
    AlreadyConnected { name: String },
}

/// Downstream sink errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispatch to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    #[error("Dispatch to {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Dispatch to {endpoint} rejected with status {status}")]
    Rejected { endpoint: String, status: u16 },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Prompt templates unavailable: {0}")]
    Prompts(#[from] ConfigError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}
