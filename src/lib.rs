//! LLM filter service: classifies messages against per-message filters.

pub mod api;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod sink;
