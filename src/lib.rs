//! Extraction worker
//!
//! A broker-driven worker that pulls text-analysis requests off a work
//! queue, extracts the requested characteristics with an LLM, persists the
//! results through three correlated request/reply calls to the storage
//! services (cost accounting, conversation history, metadata), and replies
//! to the originator using the inbound message's own reply address and
//! correlation token.
//!
//! # Quick Start
//!
//! ```rust
//! use extraction_worker::protocol::{ReplyEnvelope, WorkItem};
//!
//! let item = WorkItem {
//!     source: "library-1".to_string(),
//!     conversation_id: "conv-42".to_string(),
//!     text: "A 300-page space adventure about a lost colony.".to_string(),
//!     fields: vec!["genre".to_string(), "length".to_string()],
//! };
//! assert!(item.validate().is_ok());
//!
//! let reply = ReplyEnvelope::success("analysis recorded");
//! let json = serde_json::to_string(&reply).unwrap();
//! assert!(json.contains("\"success\":true"));
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod protocol;
pub mod reporter;
pub mod rpc;
pub mod testing;
pub mod topology;
pub mod transport;

pub use config::{ConfigError, WorkerConfig};
pub use error::{ErrorRecord, WorkerError, WorkerResult};
pub use pipeline::Orchestrator;
pub use protocol::{ReplyEnvelope, WorkItem};
pub use reporter::ErrorReporter;
pub use rpc::{CallRequest, CorrelatedClient};
pub use transport::mqtt::MqttClient;
pub use transport::Transport;
