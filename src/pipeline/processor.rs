//! Filter processor: classifies a message against its filters.
//!
//! Flow for one task:
//! 1. Split the filters into fixed-size chunks, in declaration order
//! 2. Ask the model which filter of the chunk matches (JSON `{"match": id|null}`)
//! 3. Re-ask once when the answer is unusable, then give up on that chunk
//! 4. Stop at the first chunk that yields a match
//! 5. Summarize the text when the matched filter asks for it
//!
//! A whole invocation runs under the inference slot, so the scheduler and the
//! synchronous endpoint never talk to the model at the same time.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::llm::{InferenceGateway, InferenceSlot};
use crate::pipeline::prompts::PromptTemplates;
use crate::pipeline::types::{
    ClassificationResult, ClassificationTask, Filter, MessageId, ProcessedMessage,
};

/// Default number of filters offered to the model per call.
pub const DEFAULT_CHUNK_SIZE: usize = 2;

/// Calls per chunk: the first try plus one re-ask on an unusable answer.
const CHUNK_ATTEMPTS: u32 = 2;

// ── Query payloads ──────────────────────────────────────────────────

/// Filter view sent to the model. The summary flag is withheld.
#[derive(Debug, Serialize)]
struct FilterRef<'a> {
    id: &'a str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct FilterQuery<'a> {
    messageid: MessageId,
    text: &'a str,
    filters: Vec<FilterRef<'a>>,
}

#[derive(Debug, Serialize)]
struct SummaryQuery<'a> {
    messageid: MessageId,
    text: &'a str,
}

fn to_payload<T: Serialize>(query: &T) -> String {
    // Structs of plain strings and integers always serialize.
    serde_json::to_string_pretty(query).unwrap_or_default()
}

fn filter_payload(task: &ClassificationTask, chunk: &[Filter]) -> String {
    to_payload(&FilterQuery {
        messageid: task.id,
        text: &task.text,
        filters: chunk
            .iter()
            .map(|f| FilterRef {
                id: &f.id,
                value: &f.value,
            })
            .collect(),
    })
}

fn summary_payload(task: &ClassificationTask) -> String {
    to_payload(&SummaryQuery {
        messageid: task.id,
        text: &task.text,
    })
}

// ── Response validation ─────────────────────────────────────────────

/// Why a filter response could not be used.
#[derive(Debug, thiserror::Error)]
enum InvalidReply {
    #[error("gateway failure: {0}")]
    Failure(String),

    #[error("response is not a JSON object")]
    NotAnObject,

    #[error("response has no match field")]
    MissingMatch,

    #[error("match {0} is not one of the offered filters")]
    UnknownId(String),
}

/// Check a filter response against the chunk that was offered.
///
/// `Ok(None)` is an explicit "nothing matched"; `Ok(Some(id))` always names a
/// filter from `chunk`.
fn parse_chunk_reply(reply: &Value, chunk: &[Filter]) -> Result<Option<String>, InvalidReply> {
    let object = reply.as_object().ok_or(InvalidReply::NotAnObject)?;
    let matched = object.get("match").ok_or(InvalidReply::MissingMatch)?;

    let id = match matched {
        Value::Null => return Ok(None),
        Value::String(s) => s.clone(),
        // Models sometimes drop the quotes around numeric ids.
        Value::Number(n) => n.to_string(),
        other => return Err(InvalidReply::UnknownId(other.to_string())),
    };

    if chunk.iter().any(|f| f.id == id) {
        Ok(Some(id))
    } else {
        Err(InvalidReply::UnknownId(id))
    }
}

/// Outcome of evaluating one chunk.
#[derive(Debug, PartialEq, Eq)]
enum ChunkVerdict {
    Match(String),
    NoMatch,
    Abandoned,
}

// ── Processor ───────────────────────────────────────────────────────

/// Classifies tasks against their filters through the inference gateway.
pub struct FilterProcessor {
    gateway: InferenceGateway,
    slot: InferenceSlot,
    chunk_size: usize,
}

impl FilterProcessor {
    /// Create a processor. A zero chunk size is treated as one.
    pub fn new(gateway: InferenceGateway, slot: InferenceSlot, chunk_size: usize) -> Self {
        Self {
            gateway,
            slot,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Classify one task, holding the inference slot for the whole call.
    pub async fn classify(
        &self,
        task: &ClassificationTask,
        prompts: &PromptTemplates,
    ) -> ClassificationResult {
        if task.filters.is_empty() {
            debug!(messageid = task.id, "No filters, skipping inference");
            return ClassificationResult::unmatched(task.id);
        }

        let _permit = self.slot.acquire().await;

        let matched = self.find_match(task, prompts).await;

        let wants_summary = matched
            .as_deref()
            .and_then(|id| task.filter(id))
            .is_some_and(|f| f.summary);
        let summary = if wants_summary {
            self.summarize(task, prompts).await
        } else {
            None
        };

        info!(
            messageid = task.id,
            matched = matched.as_deref().unwrap_or("none"),
            summarized = summary.is_some(),
            "Message classified"
        );

        ClassificationResult {
            messageid: task.id,
            matched,
            summary,
        }
    }

    /// Classify a list of tasks in order, for the synchronous endpoint.
    pub async fn classify_all(
        &self,
        tasks: &[ClassificationTask],
        prompts: &PromptTemplates,
    ) -> Vec<ProcessedMessage> {
        info!(count = tasks.len(), "Classifying request batch");

        let mut processed = Vec::with_capacity(tasks.len());
        for task in tasks {
            let result = self.classify(task, prompts).await;
            processed.push(ProcessedMessage {
                messageid: task.id,
                text: task.text.clone(),
                matched: result.matched,
                summary: result.summary,
            });
        }
        processed
    }

    /// Walk the chunks in order and return the first match.
    async fn find_match(
        &self,
        task: &ClassificationTask,
        prompts: &PromptTemplates,
    ) -> Option<String> {
        for (index, chunk) in task.filters.chunks(self.chunk_size).enumerate() {
            let prompt = prompts.fill_filter(&filter_payload(task, chunk));

            match self.evaluate_chunk(task.id, index, &prompt, chunk).await {
                ChunkVerdict::Match(id) => return Some(id),
                ChunkVerdict::NoMatch => {
                    debug!(messageid = task.id, chunk = index, "No match in chunk");
                }
                ChunkVerdict::Abandoned => {
                    warn!(
                        messageid = task.id,
                        chunk = index,
                        "No usable answer for chunk, skipping it"
                    );
                }
            }
        }
        None
    }

    async fn evaluate_chunk(
        &self,
        messageid: MessageId,
        index: usize,
        prompt: &str,
        chunk: &[Filter],
    ) -> ChunkVerdict {
        for attempt in 1..=CHUNK_ATTEMPTS {
            let verdict = match self.gateway.call(prompt).await {
                Ok(reply) => parse_chunk_reply(&reply, chunk),
                Err(e) => Err(InvalidReply::Failure(e.to_string())),
            };

            match verdict {
                Ok(Some(id)) => return ChunkVerdict::Match(id),
                Ok(None) => return ChunkVerdict::NoMatch,
                Err(reason) => {
                    warn!(
                        messageid,
                        chunk = index,
                        attempt,
                        reason = %reason,
                        "Invalid filter response"
                    );
                }
            }
        }
        ChunkVerdict::Abandoned
    }

    /// Ask once for a summary. Any failure leaves the summary empty.
    async fn summarize(
        &self,
        task: &ClassificationTask,
        prompts: &PromptTemplates,
    ) -> Option<String> {
        let prompt = prompts.fill_summary(&summary_payload(task));

        match self.gateway.call(&prompt).await {
            Ok(reply) => {
                let summary = reply
                    .get("summary")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if summary.is_none() {
                    warn!(messageid = task.id, "Summary response has no summary field");
                }
                summary
            }
            Err(e) => {
                warn!(messageid = task.id, error = %e, "Summary call failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::InferenceError;
    use crate::llm::InferenceBackend;

    type Responder = Box<dyn Fn(&str) -> Result<String, InferenceError> + Send + Sync>;

    /// Backend that answers through a closure and records every prompt.
    struct MockBackend {
        respond: Responder,
        prompts: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(respond: impl Fn(&str) -> Result<String, InferenceError> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                prompts: Mutex::new(Vec::new()),
            })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }

        fn filter_calls(&self) -> usize {
            self.prompts().iter().filter(|p| p.starts_with("FILTER")).count()
        }

        fn summary_calls(&self) -> usize {
            self.prompts().iter().filter(|p| p.starts_with("SUMMARY")).count()
        }
    }

    #[async_trait]
    impl InferenceBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn model_name(&self) -> &str {
            "mock"
        }

        async fn generate_json(&self, prompt: &str) -> Result<String, InferenceError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            (self.respond)(prompt)
        }
    }

    /// Ids of the filters offered in a filter prompt.
    fn offered_ids(prompt: &str) -> Vec<String> {
        let payload: Value = serde_json::from_str(prompt.trim_start_matches("FILTER:")).unwrap();
        payload["filters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["id"].as_str().unwrap().to_string())
            .collect()
    }

    fn templates() -> PromptTemplates {
        PromptTemplates::new("FILTER:$MESSAGE", "SUMMARY:$MESSAGE")
    }

    fn processor(backend: Arc<MockBackend>, max_retries: u32) -> FilterProcessor {
        let gateway = InferenceGateway::new(backend, max_retries, Duration::ZERO);
        FilterProcessor::new(gateway, InferenceSlot::new(), DEFAULT_CHUNK_SIZE)
    }

    fn filter(id: &str, summary: bool) -> Filter {
        Filter {
            id: id.into(),
            value: format!("about {id}"),
            summary,
        }
    }

    fn task(filters: Vec<Filter>) -> ClassificationTask {
        ClassificationTask {
            id: 42,
            text: "Привет, hello".into(),
            filters,
        }
    }

    #[tokio::test]
    async fn empty_filters_make_no_calls() {
        let backend = MockBackend::new(|_| Ok(r#"{"match": "x"}"#.into()));
        let result = processor(backend.clone(), 3)
            .classify(&task(vec![]), &templates())
            .await;

        assert_eq!(result, ClassificationResult::unmatched(42));
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn stops_at_first_matching_chunk() {
        let backend = MockBackend::new(|prompt| {
            let ids = offered_ids(prompt);
            if ids.contains(&"c".to_string()) {
                Ok(r#"{"match": "c"}"#.into())
            } else {
                Ok(r#"{"match": null}"#.into())
            }
        });
        let filters = ["a", "b", "c", "d", "e"].map(|id| filter(id, false)).to_vec();

        let result = processor(backend.clone(), 3)
            .classify(&task(filters), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("c"));
        assert!(result.summary.is_none());
        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(offered_ids(&prompts[0]), vec!["a", "b"]);
        assert_eq!(offered_ids(&prompts[1]), vec!["c", "d"]);
    }

    #[tokio::test]
    async fn earlier_chunk_wins_over_later() {
        let backend = MockBackend::new(|prompt| {
            let first = offered_ids(prompt).remove(0);
            Ok(format!(r#"{{"match": "{first}"}}"#))
        });
        let filters = ["a", "b", "c"].map(|id| filter(id, false)).to_vec();

        let result = processor(backend.clone(), 3)
            .classify(&task(filters), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("a"));
        assert_eq!(backend.filter_calls(), 1);
    }

    #[tokio::test]
    async fn unparseable_output_gives_two_attempts_per_chunk() {
        let backend = MockBackend::new(|_| Ok("I think it is filter a".into()));
        let filters = ["a", "b", "c"].map(|id| filter(id, true)).to_vec();

        // One gateway attempt per call, so backend calls equal gateway calls.
        let result = processor(backend.clone(), 1)
            .classify(&task(filters), &templates())
            .await;

        assert_eq!(result, ClassificationResult::unmatched(42));
        assert_eq!(backend.filter_calls(), 4);
        assert_eq!(backend.summary_calls(), 0);
    }

    #[tokio::test]
    async fn hallucinated_id_is_retried_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let backend = MockBackend::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(r#"{"match": "zzz"}"#.into())
            } else {
                Ok(r#"{"match": "b"}"#.into())
            }
        });

        let result = processor(backend.clone(), 3)
            .classify(&task(vec![filter("a", false), filter("b", false)]), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("b"));
        assert_eq!(backend.filter_calls(), 2);
    }

    #[tokio::test]
    async fn id_from_another_chunk_is_never_accepted() {
        // Always names "c", which is only valid for the second chunk.
        let backend = MockBackend::new(|_| Ok(r#"{"match": "c"}"#.into()));
        let filters = ["a", "b", "c"].map(|id| filter(id, false)).to_vec();

        let result = processor(backend.clone(), 3)
            .classify(&task(filters), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("c"));
        let prompts = backend.prompts();
        // Chunk [a,b] rejected twice, then chunk [c] accepted.
        assert_eq!(prompts.len(), 3);
        assert_eq!(offered_ids(&prompts[2]), vec!["c"]);
    }

    #[tokio::test]
    async fn missing_match_field_is_invalid() {
        let backend = MockBackend::new(|_| Ok(r#"{"result": "a"}"#.into()));
        let result = processor(backend.clone(), 1)
            .classify(&task(vec![filter("a", false)]), &templates())
            .await;

        assert!(result.matched.is_none());
        assert_eq!(backend.filter_calls(), 2);
    }

    #[tokio::test]
    async fn explicit_null_is_not_retried() {
        let backend = MockBackend::new(|_| Ok(r#"{"match": null}"#.into()));
        let result = processor(backend.clone(), 3)
            .classify(&task(vec![filter("a", true)]), &templates())
            .await;

        assert!(result.matched.is_none());
        assert_eq!(backend.filter_calls(), 1);
    }

    #[tokio::test]
    async fn numeric_match_is_compared_as_text() {
        let backend = MockBackend::new(|_| Ok(r#"{"match": 7}"#.into()));
        let result = processor(backend, 3)
            .classify(&task(vec![filter("7", false)]), &templates())
            .await;
        assert_eq!(result.matched.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn summary_flag_triggers_exactly_one_summary_call() {
        let backend = MockBackend::new(|prompt| {
            if prompt.starts_with("SUMMARY") {
                Ok(r#"{"summary": "short"}"#.into())
            } else {
                Ok(r#"{"match": "x"}"#.into())
            }
        });

        let result = processor(backend.clone(), 3)
            .classify(&task(vec![filter("x", true)]), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("x"));
        assert_eq!(result.summary.as_deref(), Some("short"));
        assert_eq!(backend.summary_calls(), 1);

        let summary_prompt = backend
            .prompts()
            .into_iter()
            .find(|p| p.starts_with("SUMMARY"))
            .unwrap();
        let payload: Value =
            serde_json::from_str(summary_prompt.trim_start_matches("SUMMARY:")).unwrap();
        assert_eq!(payload, serde_json::json!({"messageid": 42, "text": "Привет, hello"}));
    }

    #[tokio::test]
    async fn no_summary_when_flag_is_false() {
        let backend = MockBackend::new(|prompt| {
            if prompt.starts_with("SUMMARY") {
                Ok(r#"{"summary": "unexpected"}"#.into())
            } else {
                Ok(r#"{"match": "x"}"#.into())
            }
        });

        let result = processor(backend.clone(), 3)
            .classify(&task(vec![filter("x", false), filter("y", true)]), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("x"));
        assert!(result.summary.is_none());
        assert_eq!(backend.summary_calls(), 0);
    }

    #[tokio::test]
    async fn summary_without_field_stays_empty() {
        let backend = MockBackend::new(|prompt| {
            if prompt.starts_with("SUMMARY") {
                Ok(r#"{"text": "nope"}"#.into())
            } else {
                Ok(r#"{"match": "x"}"#.into())
            }
        });

        let result = processor(backend.clone(), 3)
            .classify(&task(vec![filter("x", true)]), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("x"));
        assert!(result.summary.is_none());
        // Not retried at the chunk level.
        assert_eq!(backend.summary_calls(), 1);
    }

    #[tokio::test]
    async fn summary_failure_keeps_match() {
        let backend = MockBackend::new(|prompt| {
            if prompt.starts_with("SUMMARY") {
                Err(InferenceError::RequestFailed {
                    backend: "mock".into(),
                    reason: "down".into(),
                })
            } else {
                Ok(r#"{"match": "x"}"#.into())
            }
        });

        let result = processor(backend.clone(), 2)
            .classify(&task(vec![filter("x", true)]), &templates())
            .await;

        assert_eq!(result.matched.as_deref(), Some("x"));
        assert!(result.summary.is_none());
        // Gateway attempts still apply inside the single summary call.
        assert_eq!(backend.summary_calls(), 2);
    }

    #[tokio::test]
    async fn filter_payload_withholds_summary_flag() {
        let backend = MockBackend::new(|_| Ok(r#"{"match": null}"#.into()));
        processor(backend.clone(), 3)
            .classify(&task(vec![filter("x", true)]), &templates())
            .await;

        let prompt = &backend.prompts()[0];
        let payload: Value = serde_json::from_str(prompt.trim_start_matches("FILTER:")).unwrap();
        assert_eq!(payload["messageid"], 42);
        assert_eq!(payload["filters"], serde_json::json!([{"id": "x", "value": "about x"}]));
        // Non-ASCII text is passed through unescaped.
        assert!(prompt.contains("Привет"));
    }

    #[tokio::test]
    async fn concurrent_classifications_never_overlap() {
        struct SlowBackend {
            in_flight: AtomicUsize,
            peak: AtomicUsize,
        }

        #[async_trait]
        impl InferenceBackend for SlowBackend {
            fn name(&self) -> &str {
                "slow"
            }
            fn model_name(&self) -> &str {
                "slow"
            }
            async fn generate_json(&self, _prompt: &str) -> Result<String, InferenceError> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(r#"{"match": null}"#.into())
            }
        }

        let backend = Arc::new(SlowBackend {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let gateway = InferenceGateway::new(backend.clone(), 1, Duration::ZERO);
        let processor = Arc::new(FilterProcessor::new(gateway, InferenceSlot::new(), 1));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let processor = Arc::clone(&processor);
            handles.push(tokio::spawn(async move {
                let filters = vec![filter("a", false), filter("b", false)];
                processor.classify(&task(filters), &templates()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classify_all_preserves_order_and_text() {
        let backend = MockBackend::new(|_| Ok(r#"{"match": "x"}"#.into()));
        let tasks = vec![
            ClassificationTask {
                id: 1,
                text: "one".into(),
                filters: vec![filter("x", false)],
            },
            ClassificationTask {
                id: 2,
                text: "two".into(),
                filters: vec![],
            },
        ];

        let processed = processor(backend, 3).classify_all(&tasks, &templates()).await;

        assert_eq!(processed.len(), 2);
        assert_eq!(processed[0].messageid, 1);
        assert_eq!(processed[0].matched.as_deref(), Some("x"));
        assert_eq!(processed[1].text, "two");
        assert!(processed[1].matched.is_none());
    }

    #[test]
    fn parse_rejects_non_object() {
        let chunk = vec![filter("a", false)];
        assert!(matches!(
            parse_chunk_reply(&serde_json::json!(["a"]), &chunk),
            Err(InvalidReply::NotAnObject)
        ));
    }
}
