//! Transport layer for broker communication.
//!
//! This module provides the transport abstraction plus the MQTT
//! implementation. The trait exists so the correlated call client and the
//! pipeline can be exercised against an in-memory broker in tests.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Transport errors shared by all implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Acknowledgment failed")]
    AckFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: String },
}

/// Metadata attached to a published message: the reply destination and the
/// correlation token pairing a call with its one reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl MessageProperties {
    pub fn correlated(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
        }
    }
}

/// Acknowledgment handle for one delivery. Consuming `ack` makes double
/// acknowledgment unrepresentable.
#[async_trait::async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;
}

/// One message delivered by the broker.
///
/// The ack handle is taken on first `ack()`, so a delivery is acknowledged at
/// most once no matter how the processing code is shaped.
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        properties: MessageProperties,
        acker: Option<Box<dyn Acker>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            properties,
            acker,
        }
    }

    /// Acknowledge consumption of this delivery. Subsequent calls are no-ops.
    pub async fn ack(&mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Whether the delivery still holds an unconsumed ack handle.
    pub fn is_acked(&self) -> bool {
        self.acker.is_none()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Teardown hook for a reply channel. `close` unsubscribes on the broker;
/// `abandon` only drops the local route and is safe to call from `Drop`.
#[async_trait::async_trait]
pub trait ReplyChannelCloser: Send {
    async fn close(self: Box<Self>, topic: &str);
    fn abandon(&self, topic: &str);
}

/// Per-call reply subscription. Exactly one of these exists for each
/// in-flight correlated call; it must not outlive the call.
pub struct ReplyChannel {
    topic: String,
    receiver: mpsc::Receiver<Delivery>,
    closer: Option<Box<dyn ReplyChannelCloser>>,
}

impl ReplyChannel {
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::Receiver<Delivery>,
        closer: Box<dyn ReplyChannelCloser>,
    ) -> Self {
        Self {
            topic: topic.into(),
            receiver,
            closer: Some(closer),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next delivery on this reply destination.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }

    /// Tear the subscription down. Called on every call-completion path.
    pub async fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            closer.close(&self.topic).await;
        }
    }
}

impl Drop for ReplyChannel {
    fn drop(&mut self) {
        // Fallback for early-return paths: the local route must never be
        // left registered, even if the broker unsubscribe is skipped.
        if let Some(closer) = self.closer.take() {
            closer.abandon(&self.topic);
        }
    }
}

/// Transport trait for broker communication.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Publish one message to a topic with the given properties.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    /// Subscribe the inbound work topic, forwarding deliveries into `sender`.
    async fn subscribe_work(
        &self,
        topic: &str,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<(), TransportError>;

    /// Open a short-lived subscription on a per-call reply topic.
    async fn open_reply_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> Result<ReplyChannel, TransportError>;

    /// Check if transport is currently connected.
    fn is_connected(&self) -> bool;
}

/// Routing table shared between a transport's event loop and its reply
/// channels. Kept behind std mutexes so `Drop` teardown can deregister
/// without an async context.
#[derive(Default)]
pub struct RouteTable {
    work: StdMutex<Option<(String, mpsc::Sender<Delivery>)>>,
    replies: StdMutex<HashMap<String, mpsc::Sender<Delivery>>>,
}

/// Where the route table decided a delivery should go.
#[derive(Debug, PartialEq)]
pub enum RouteOutcome {
    Work,
    Reply,
    WorkChannelFull,
    NoRoute,
}

impl RouteTable {
    pub fn set_work_route(&self, topic: &str, sender: mpsc::Sender<Delivery>) {
        let mut work = self.work.lock().expect("route table poisoned");
        *work = Some((topic.to_string(), sender));
    }

    pub fn insert_reply_route(&self, topic: &str, sender: mpsc::Sender<Delivery>) {
        let mut replies = self.replies.lock().expect("route table poisoned");
        replies.insert(topic.to_string(), sender);
    }

    pub fn remove_reply_route(&self, topic: &str) {
        let mut replies = self.replies.lock().expect("route table poisoned");
        replies.remove(topic);
    }

    /// All topics with an active consumer, for re-subscription after a
    /// broker reconnect.
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics = Vec::new();
        if let Some((topic, _)) = &*self.work.lock().expect("route table poisoned") {
            topics.push(topic.clone());
        }
        topics.extend(
            self.replies
                .lock()
                .expect("route table poisoned")
                .keys()
                .cloned(),
        );
        topics
    }

    /// Route a delivery to its consumer. Reply routes take priority; the
    /// work channel is bounded, and overflow is reported rather than
    /// blocking the event loop (replies must keep flowing while the
    /// pipeline is saturated).
    pub fn route(&self, delivery: Delivery) -> (RouteOutcome, Option<Delivery>) {
        {
            let replies = self.replies.lock().expect("route table poisoned");
            if let Some(sender) = replies.get(&delivery.topic) {
                return match sender.try_send(delivery) {
                    Ok(()) => (RouteOutcome::Reply, None),
                    Err(mpsc::error::TrySendError::Full(d))
                    | Err(mpsc::error::TrySendError::Closed(d)) => (RouteOutcome::NoRoute, Some(d)),
                };
            }
        }

        let work = self.work.lock().expect("route table poisoned");
        if let Some((topic, sender)) = &*work {
            if *topic == delivery.topic {
                return match sender.try_send(delivery) {
                    Ok(()) => (RouteOutcome::Work, None),
                    Err(mpsc::error::TrySendError::Full(d)) => {
                        (RouteOutcome::WorkChannelFull, Some(d))
                    }
                    Err(mpsc::error::TrySendError::Closed(d)) => (RouteOutcome::NoRoute, Some(d)),
                };
            }
        }

        (RouteOutcome::NoRoute, Some(delivery))
    }
}
