//! Shared test doubles for the integration tests.

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use llm_filter::error::{DispatchError, InferenceError};
use llm_filter::llm::{InferenceBackend, InferenceGateway, InferenceSlot};
use llm_filter::pipeline::processor::FilterProcessor;
use llm_filter::pipeline::prompts::{PromptSource, PromptTemplates};
use llm_filter::pipeline::types::{EnrichedResult, Filter, IncomingMessage};
use llm_filter::sink::ResultSink;

/// Maximum time any test is allowed to run before we consider it hung.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Templates that leave the JSON payload easy to pick apart.
pub fn fixed_prompts() -> PromptSource {
    PromptSource::Fixed(PromptTemplates::new("FILTER:$MESSAGE", "SUMMARY:$MESSAGE"))
}

/// Stub model: matches the first offered filter whose value occurs in the
/// message text, and summarizes as `"summary of <text>"` unless a fixed
/// summary is set.
#[derive(Default)]
pub struct SubstringLlm {
    pub calls: AtomicUsize,
    pub fixed_summary: Option<String>,
}

impl SubstringLlm {
    pub fn with_summary(summary: &str) -> Self {
        Self {
            fixed_summary: Some(summary.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceBackend for SubstringLlm {
    fn name(&self) -> &str {
        "substring"
    }

    fn model_name(&self) -> &str {
        "stub"
    }

    async fn generate_json(&self, prompt: &str) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(payload) = prompt.strip_prefix("SUMMARY:") {
            let query: serde_json::Value = serde_json::from_str(payload)?;
            let summary = match &self.fixed_summary {
                Some(fixed) => fixed.clone(),
                None => format!("summary of {}", query["text"].as_str().unwrap_or_default()),
            };
            return Ok(serde_json::json!({ "summary": summary }).to_string());
        }

        let payload = prompt.trim_start_matches("FILTER:");
        let query: serde_json::Value = serde_json::from_str(payload)?;
        let text = query["text"].as_str().unwrap_or_default();
        let hit = query["filters"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|f| f["value"].as_str().is_some_and(|v| text.contains(v)));

        Ok(match hit {
            Some(f) => serde_json::json!({ "match": f["id"] }).to_string(),
            None => r#"{"match": null}"#.to_string(),
        })
    }
}

/// Processor over `backend` with one attempt per call and no backoff.
pub fn processor(backend: Arc<dyn InferenceBackend>) -> Arc<FilterProcessor> {
    let gateway = InferenceGateway::new(backend, 1, Duration::ZERO);
    Arc::new(FilterProcessor::new(gateway, InferenceSlot::new(), 2))
}

/// Sink that keeps every batch it is handed.
#[derive(Default)]
pub struct RecordingSink {
    pub batches: Mutex<Vec<Vec<EnrichedResult>>>,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Vec<EnrichedResult>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<EnrichedResult> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn dispatch(&self, batch: &[EnrichedResult]) -> Result<(), DispatchError> {
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

/// Build a message carrying the given `(id, value, summary)` filters.
pub fn message(id: i64, text: &str, filters: &[(&str, &str, bool)]) -> IncomingMessage {
    IncomingMessage {
        id,
        text: text.to_string(),
        filters: filters
            .iter()
            .map(|(fid, value, summary)| Filter {
                id: fid.to_string(),
                value: value.to_string(),
                summary: *summary,
            })
            .collect(),
        chatid: (1000 + id).into(),
        userid: (2000 + id).into(),
        timestamp: format!("t{id}").into(),
    }
}
