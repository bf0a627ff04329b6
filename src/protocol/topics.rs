//! Topic construction for the broker.
//!
//! The storage services are addressed by exchange name plus routing key; both
//! map onto a canonical topic path. Reply destinations are fresh per call so
//! concurrent calls never share a listener.

use uuid::Uuid;

/// Canonicalize a topic path: collapse duplicate slashes, trim the trailing
/// one, keep a single leading slash.
pub fn canonicalize_topic(topic: &str) -> String {
    let mut canonical = String::with_capacity(topic.len() + 1);
    canonical.push('/');
    for segment in topic.split('/').filter(|s| !s.is_empty()) {
        if canonical.len() > 1 {
            canonical.push('/');
        }
        canonical.push_str(segment);
    }
    canonical
}

/// Topic construction helpers.
pub struct TopicBuilder;

impl TopicBuilder {
    /// Request topic for a storage call: `/exchanges/{exchange}/{routing_key}`.
    pub fn request_topic(exchange: &str, routing_key: &str) -> String {
        canonicalize_topic(&format!("/exchanges/{exchange}/{routing_key}"))
    }

    /// Inbound work topic the worker consumes:
    /// `/exchanges/{exchange}/{routing_key}`.
    pub fn work_topic(exchange: &str, routing_key: &str) -> String {
        Self::request_topic(exchange, routing_key)
    }

    /// Fresh reply topic for one in-flight call:
    /// `/replies/{routing_key}/{uuid}`.
    pub fn reply_topic(routing_key: &str) -> String {
        canonicalize_topic(&format!("/replies/{routing_key}/{}", Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_topic() {
        assert_eq!(
            TopicBuilder::request_topic("db-crud", "records.cost"),
            "/exchanges/db-crud/records.cost"
        );
    }

    #[test]
    fn test_canonicalization_collapses_slashes() {
        assert_eq!(canonicalize_topic("//a//b/"), "/a/b");
        assert_eq!(canonicalize_topic("a/b"), "/a/b");
        assert_eq!(canonicalize_topic("/"), "/");
        assert_eq!(
            TopicBuilder::request_topic("db-crud/", "/records.cost"),
            "/exchanges/db-crud/records.cost"
        );
    }

    #[test]
    fn test_reply_topics_are_unique_per_call() {
        let a = TopicBuilder::reply_topic("records.cost");
        let b = TopicBuilder::reply_topic("records.cost");
        assert!(a.starts_with("/replies/records.cost/"));
        assert_ne!(a, b);
    }
}
