//! Inference integration.
//!
//! - `InferenceBackend`: one prompt in, raw JSON text out
//! - `OllamaBackend`: the HTTP implementation used in production
//! - `InferenceGateway`: retries and JSON parsing on top of a backend
//! - `InferenceSlot`: serializes access to the single inference runtime

pub mod gateway;
pub mod ollama;
pub mod provider;

pub use gateway::{InferenceGateway, InferenceSlot};
pub use ollama::OllamaBackend;
pub use provider::InferenceBackend;
