//! Error taxonomy for the extraction worker.
//!
//! One tagged enum covers the whole pipeline; handling sites match on kind.
//! Call errors carry the exchange and routing key of the call that failed so
//! failure replies and error records can name the downstream service.

use crate::config::ConfigError;
use crate::protocol::WorkItem;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Main error type for worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Work item failed a local precondition; no remote call was made.
    #[error("Invalid work item: {message}")]
    Validation { message: String },

    /// The analysis capability declined or failed.
    #[error("Text analysis failed: {message}")]
    Analysis { message: String },

    /// A correlated call saw no matching reply before the deadline.
    #[error("Call to {exchange}/{routing_key} timed out after {timeout_secs}s")]
    CallTimeout {
        exchange: String,
        routing_key: String,
        timeout_secs: u64,
    },

    /// Publish or subscribe failed during a correlated call.
    #[error("Call to {exchange}/{routing_key} failed: {source}")]
    CallTransport {
        exchange: String,
        routing_key: String,
        #[source]
        source: TransportError,
    },

    /// The downstream service replied, but reported failure.
    #[error("Call to {exchange}/{routing_key} was rejected: {message}")]
    CallFailed {
        exchange: String,
        routing_key: String,
        message: String,
    },

    /// A reply arrived whose correlation token does not belong to this call.
    /// The call keeps listening for its own reply; this variant records the
    /// cross-talk for logging and telemetry.
    #[error("Mismatched correlation on {exchange}/{routing_key}: expected {expected}, got {received}")]
    CallMismatch {
        exchange: String,
        routing_key: String,
        expected: String,
        received: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl WorkerError {
    /// Stable kind tag used in error records and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Validation { .. } => "validation_error",
            WorkerError::Analysis { .. } => "analysis_error",
            WorkerError::CallTimeout { .. } => "call_timeout_error",
            WorkerError::CallTransport { .. } => "call_transport_error",
            WorkerError::CallFailed { .. } => "call_failed_error",
            WorkerError::CallMismatch { .. } => "call_mismatch_error",
            WorkerError::Config(_) => "config_error",
            WorkerError::Transport(_) => "transport_error",
        }
    }

    /// The exchange/routing key of the failed call, when this is a call error.
    pub fn call_target(&self) -> Option<(&str, &str)> {
        match self {
            WorkerError::CallTimeout {
                exchange,
                routing_key,
                ..
            }
            | WorkerError::CallTransport {
                exchange,
                routing_key,
                ..
            }
            | WorkerError::CallFailed {
                exchange,
                routing_key,
                ..
            }
            | WorkerError::CallMismatch {
                exchange,
                routing_key,
                ..
            } => Some((exchange, routing_key)),
            _ => None,
        }
    }

    /// Build the structured record forwarded to the error reporter.
    pub fn to_record(&self, worker: &str, item: Option<&WorkItem>) -> ErrorRecord {
        let (exchange, routing_key) = match self.call_target() {
            Some((exchange, routing_key)) => {
                (Some(exchange.to_string()), Some(routing_key.to_string()))
            }
            None => (None, None),
        };

        ErrorRecord {
            kind: self.kind().to_string(),
            message: self.to_string(),
            worker: worker.to_string(),
            timestamp: Utc::now(),
            payload: item.cloned(),
            exchange,
            routing_key,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        Self::Analysis {
            message: message.into(),
        }
    }
}

/// Structured error record sent to the error-telemetry endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub worker: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<WorkItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_item() -> WorkItem {
        WorkItem {
            source: "lib1".to_string(),
            conversation_id: "c1".to_string(),
            text: "300-page space adventure".to_string(),
            fields: vec!["genre".to_string()],
        }
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(
            WorkerError::validation("missing text").kind(),
            "validation_error"
        );
        assert_eq!(WorkerError::analysis("refused").kind(), "analysis_error");
        assert_eq!(
            WorkerError::CallTimeout {
                exchange: "db-crud".to_string(),
                routing_key: "records.cost".to_string(),
                timeout_secs: 30,
            }
            .kind(),
            "call_timeout_error"
        );
    }

    #[test]
    fn test_call_target_present_only_for_call_errors() {
        let timeout = WorkerError::CallTimeout {
            exchange: "db-crud".to_string(),
            routing_key: "records.cost".to_string(),
            timeout_secs: 30,
        };
        assert_eq!(timeout.call_target(), Some(("db-crud", "records.cost")));
        assert!(WorkerError::validation("x").call_target().is_none());
    }

    #[test]
    fn test_record_carries_call_target_and_payload() {
        let error = WorkerError::CallFailed {
            exchange: "db-crud".to_string(),
            routing_key: "records.conversation".to_string(),
            message: "write rejected".to_string(),
        };

        let item = test_item();
        let record = error.to_record("extraction-worker", Some(&item));
        assert_eq!(record.kind, "call_failed_error");
        assert_eq!(record.worker, "extraction-worker");
        assert_eq!(record.exchange.as_deref(), Some("db-crud"));
        assert_eq!(record.routing_key.as_deref(), Some("records.conversation"));
        assert_eq!(record.payload.as_ref().map(|p| p.source.as_str()), Some("lib1"));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = WorkerError::validation("empty text").to_record("w1", None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "validation_error");
        assert!(json.get("routingKey").is_none());
        assert!(json.get("payload").is_none());
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_timeout_display_names_the_target() {
        let error = WorkerError::CallTimeout {
            exchange: "db-crud".to_string(),
            routing_key: "records.cost".to_string(),
            timeout_secs: 30,
        };
        let text = error.to_string();
        assert!(text.contains("db-crud/records.cost"));
        assert!(text.contains("30s"));
    }
}
