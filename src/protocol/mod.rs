//! Protocol types: wire message shapes and topic construction.

pub mod messages;
pub mod topics;

pub use messages::{
    ChatTurn, ConversationRecord, CostRecord, MetadataPayload, MetadataRecord, ReplyEnvelope,
    TokenUsage, WorkItem,
};
pub use topics::{canonicalize_topic, TopicBuilder};
