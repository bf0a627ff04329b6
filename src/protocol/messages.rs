//! Wire shapes for inbound work items, correlated replies, and the
//! persistence payloads sent to the storage services.
//!
//! All broker JSON uses camelCase field names; the inbound shape matches what
//! the upstream chat service publishes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One unit of inbound work pulled off the work queue.
///
/// Immutable once parsed; the pipeline only reads from it. Deserialization
/// fails when any of the four fields is missing, which is how structurally
/// malformed messages are detected (they are acked and skipped, no reply).
/// Extra fields from newer publishers are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Library/source identifier the conversation belongs to.
    pub source: String,
    /// Conversation the analyzed text is part of.
    pub conversation_id: String,
    /// Raw text to analyze.
    pub text: String,
    /// Field names the analysis capability should extract.
    pub fields: Vec<String>,
}

impl WorkItem {
    /// Validate the pipeline preconditions that are not structural:
    /// text and field list must both be non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.text.trim().is_empty() {
            return Err("work item has empty text".to_string());
        }
        if self.fields.is_empty() {
            return Err("work item has empty field list".to_string());
        }
        Ok(())
    }
}

/// Body of every correlated reply: `{ success, message?, ...result }`.
///
/// Downstream storage services attach result fields beside `success`, which
/// land in `extra`. The same shape is used for the final reply sent back to
/// the work item's originator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl ReplyEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            extra: HashMap::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            extra: HashMap::new(),
        }
    }
}

/// Token accounting reported by the analysis capability and persisted by the
/// cost-recording call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
}

/// Payload of the cost-accounting persistence call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub source: String,
    pub conversation_id: String,
    pub tokens: TokenUsage,
}

/// One turn of conversation history. The pipeline only ever records the
/// client-originated turn carrying the raw inbound text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub sender: String,
    pub message: String,
}

impl ChatTurn {
    pub fn client(message: impl Into<String>) -> Self {
        Self {
            sender: "client".to_string(),
            message: message.into(),
        }
    }
}

/// Payload of the conversation-history persistence call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub source: String,
    pub conversation_id: String,
    pub turn: ChatTurn,
}

/// Fixed metadata shape persisted by the third call. Each slot is filled from
/// the extracted fields when the capability returned that field, and omitted
/// otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_works: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_theme: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotional_context: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<Vec<String>>,
}

impl MetadataRecord {
    /// Map extracted fields onto the fixed metadata slots by field name.
    pub fn from_fields(fields: &HashMap<String, Vec<String>>) -> Self {
        let pick = |name: &str| fields.get(name).cloned();
        Self {
            genre: pick("genre"),
            prior_works: pick("prior_works"),
            authors: pick("authors"),
            main_theme: pick("main_theme"),
            setting: pick("setting"),
            emotional_context: pick("emotional_context"),
            length: pick("length"),
        }
    }
}

/// Payload of the metadata persistence call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPayload {
    pub source: String,
    pub conversation_id: String,
    pub base: MetadataRecord,
}
