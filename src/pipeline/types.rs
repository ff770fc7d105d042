//! Shared types for the classification pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-assigned message identifier.
pub type MessageId = i64;

// ── Inbound message ─────────────────────────────────────────────────

/// A classification criterion supplied with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Unique within the message's filter set.
    pub id: String,
    /// Natural-language description the model compares the text against.
    pub value: String,
    /// A match on this filter requires a follow-up summary call.
    #[serde(default)]
    pub summary: bool,
}

/// Full inbound message as produced by an ingestion source.
///
/// Held in the correlation store until its classification resolves, so
/// the chat and user attributes can be reunited with the result. Those
/// attributes are opaque to the service and passed through as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    #[serde(rename = "messageid")]
    pub id: MessageId,
    pub text: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub chatid: Value,
    pub userid: Value,
    /// `null` when the sender omits it.
    #[serde(default)]
    pub timestamp: Value,
}

impl IncomingMessage {
    /// Derive the inference-only view of this message.
    pub fn task(&self) -> ClassificationTask {
        ClassificationTask {
            id: self.id,
            text: self.text.clone(),
            filters: self.filters.clone(),
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// The subset of a message the processor needs.
///
/// Also the accepted shape of one element of a synchronous `/process`
/// request, which carries no chat/user attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationTask {
    #[serde(rename = "messageid")]
    pub id: MessageId,
    pub text: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

impl ClassificationTask {
    /// Look up one of this task's filters by id.
    pub fn filter(&self, id: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.id == id)
    }
}

/// Outcome of classifying one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub messageid: MessageId,
    /// Id of the matched filter, `None` when nothing matched.
    #[serde(rename = "match")]
    pub matched: Option<String>,
    pub summary: Option<String>,
}

impl ClassificationResult {
    /// A result with neither match nor summary.
    pub fn unmatched(messageid: MessageId) -> Self {
        Self {
            messageid,
            matched: None,
            summary: None,
        }
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Result joined with the original message attributes, sent downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedResult {
    pub messageid: MessageId,
    pub chatid: Value,
    pub userid: Value,
    pub text: String,
    pub timestamp: Value,
    pub summary: Option<String>,
    #[serde(rename = "match")]
    pub matched: Option<String>,
}

impl EnrichedResult {
    /// Merge a classification result with the message it came from.
    pub fn assemble(result: ClassificationResult, original: IncomingMessage) -> Self {
        Self {
            messageid: result.messageid,
            chatid: original.chatid,
            userid: original.userid,
            text: original.text,
            timestamp: original.timestamp,
            summary: result.summary,
            matched: result.matched,
        }
    }
}

/// One element of a synchronous `/process` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMessage {
    pub messageid: MessageId,
    pub text: String,
    #[serde(rename = "match")]
    pub matched: Option<String>,
    pub summary: Option<String>,
}
