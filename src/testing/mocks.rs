//! In-memory transport and analyzer doubles.
//!
//! `MockTransport` routes through the same [`RouteTable`] the MQTT client
//! uses, so the correlated call client and the pipeline are exercised against
//! the real routing semantics without a broker.

use crate::llm::{AnalysisError, Analyzer, Extraction};
use crate::protocol::TokenUsage;
use crate::transport::{
    Acker, Delivery, MessageProperties, ReplyChannel, ReplyChannelCloser, RouteTable, Transport,
    TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;

/// One message published through the mock, as the test observes it.
#[derive(Debug, Clone)]
pub struct PublishedRequest {
    pub topic: String,
    pub payload: serde_json::Value,
    pub properties: MessageProperties,
}

/// A scripted reply the responder injects for one published request.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub correlation_id: String,
    pub payload: serde_json::Value,
}

impl MockReply {
    /// Reply that echoes the request's own correlation token.
    pub fn matching(request: &PublishedRequest, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: request
                .properties
                .correlation_id
                .clone()
                .unwrap_or_default(),
            payload,
        }
    }
}

type Responder = Box<dyn Fn(&PublishedRequest) -> Vec<MockReply> + Send + Sync>;

/// In-memory transport double.
pub struct MockTransport {
    routes: Arc<RouteTable>,
    published: StdMutex<Vec<PublishedRequest>>,
    responder: StdMutex<Option<Responder>>,
    open_reply_channels: Arc<AtomicUsize>,
    acked_replies: Arc<AtomicUsize>,
    connected: AtomicBool,
    fail_publish: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            routes: Arc::new(RouteTable::default()),
            published: StdMutex::new(Vec::new()),
            responder: StdMutex::new(None),
            open_reply_channels: Arc::new(AtomicUsize::new(0)),
            acked_replies: Arc::new(AtomicUsize::new(0)),
            connected: AtomicBool::new(true),
            fail_publish: AtomicBool::new(false),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script replies for future publishes. The responder sees each published
    /// request and returns the deliveries to inject on its reply topic.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&PublishedRequest) -> Vec<MockReply> + Send + Sync + 'static,
    {
        *self.responder.lock().expect("responder poisoned") = Some(Box::new(responder));
    }

    /// All messages published so far.
    pub fn published(&self) -> Vec<PublishedRequest> {
        self.published.lock().expect("published poisoned").clone()
    }

    /// Reply subscriptions currently open. Zero once every call has torn its
    /// listener down.
    pub fn open_reply_channels(&self) -> usize {
        self.open_reply_channels.load(Ordering::SeqCst)
    }

    /// Reply deliveries acknowledged so far, matching or not.
    pub fn acked_replies(&self) -> usize {
        self.acked_replies.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next_publish(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    /// Inject one delivery directly, as if the broker pushed it.
    pub fn inject(&self, topic: &str, payload: serde_json::Value, correlation_id: Option<String>) {
        self.inject_with_properties(
            topic,
            payload,
            MessageProperties {
                reply_to: None,
                correlation_id,
            },
        );
    }

    /// Inject one delivery with full message properties.
    pub fn inject_with_properties(
        &self,
        topic: &str,
        payload: serde_json::Value,
        properties: MessageProperties,
    ) {
        let delivery = Delivery::new(
            topic,
            serde_json::to_vec(&payload).expect("payload serializes"),
            properties,
            Some(Box::new(CountingAcker(self.acked_replies.clone()))),
        );
        let _ = self.routes.route(delivery);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        if self.fail_publish.swap(false, Ordering::SeqCst) {
            return Err(TransportError::PublishFailed("scripted failure".into()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected {
                state: "disconnected".to_string(),
            });
        }

        let request = PublishedRequest {
            topic: topic.to_string(),
            payload: serde_json::from_slice(&payload)
                .map_err(TransportError::SerializationError)?,
            properties,
        };
        self.published
            .lock()
            .expect("published poisoned")
            .push(request.clone());

        let replies = {
            let responder = self.responder.lock().expect("responder poisoned");
            responder.as_ref().map(|r| r(&request)).unwrap_or_default()
        };
        if let Some(reply_to) = &request.properties.reply_to {
            for reply in replies {
                self.inject(reply_to, reply.payload, Some(reply.correlation_id));
            }
        }

        Ok(())
    }

    async fn subscribe_work(
        &self,
        topic: &str,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<(), TransportError> {
        self.routes.set_work_route(topic, sender);
        Ok(())
    }

    async fn open_reply_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> Result<ReplyChannel, TransportError> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.routes.insert_reply_route(topic, sender);
        self.open_reply_channels.fetch_add(1, Ordering::SeqCst);

        Ok(ReplyChannel::new(
            topic,
            receiver,
            Box::new(MockReplyCloser {
                routes: self.routes.clone(),
                open_reply_channels: self.open_reply_channels.clone(),
            }),
        ))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockReplyCloser {
    routes: Arc<RouteTable>,
    open_reply_channels: Arc<AtomicUsize>,
}

impl MockReplyCloser {
    fn teardown(&self, topic: &str) {
        self.routes.remove_reply_route(topic);
        self.open_reply_channels.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplyChannelCloser for MockReplyCloser {
    async fn close(self: Box<Self>, topic: &str) {
        self.teardown(topic);
    }

    fn abandon(&self, topic: &str) {
        self.teardown(topic);
    }
}

/// Ack handle that bumps a shared counter.
pub struct CountingAcker(pub Arc<AtomicUsize>);

#[async_trait]
impl Acker for CountingAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted analyzer double.
pub struct MockAnalyzer {
    failure: Option<AnalysisError>,
    calls: StdMutex<Vec<(String, Vec<String>)>>,
}

impl Default for MockAnalyzer {
    fn default() -> Self {
        Self {
            failure: None,
            calls: StdMutex::new(Vec::new()),
        }
    }
}

impl MockAnalyzer {
    /// Analyzer that answers every request with `mock-{field}` values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyzer that fails every request with the given error.
    pub fn failing(error: AnalysisError) -> Self {
        Self {
            failure: Some(error),
            calls: StdMutex::new(Vec::new()),
        }
    }

    /// Texts and field lists this analyzer was asked about.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().expect("calls poisoned").clone()
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    async fn extract(&self, text: &str, fields: &[String]) -> Result<Extraction, AnalysisError> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .push((text.to_string(), fields.to_vec()));

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let fields: HashMap<String, Vec<String>> = fields
            .iter()
            .map(|field| (field.clone(), vec![format!("mock-{field}")]))
            .collect();

        Ok(Extraction {
            fields,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                model: "mock-model".to_string(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_mock_transport_records_publishes() {
        let transport = MockTransport::new();
        transport
            .publish(
                "/exchanges/db-crud/records.cost",
                serde_json::to_vec(&json!({"a": 1})).unwrap(),
                MessageProperties::default(),
            )
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/exchanges/db-crud/records.cost");
        assert_eq!(published[0].payload["a"], json!(1));
    }

    #[tokio::test]
    async fn test_responder_feeds_reply_channel() {
        let transport = MockTransport::new();
        transport.set_responder(|request| {
            vec![MockReply::matching(request, json!({"success": true}))]
        });

        let mut channel = transport
            .open_reply_channel("/replies/records.cost/t1", 4)
            .await
            .unwrap();
        assert_eq!(transport.open_reply_channels(), 1);

        transport
            .publish(
                "/exchanges/db-crud/records.cost",
                b"{}".to_vec(),
                MessageProperties::correlated("/replies/records.cost/t1", "t1"),
            )
            .await
            .unwrap();

        let mut delivery = channel.recv().await.unwrap();
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("t1"));
        delivery.ack().await.unwrap();
        assert_eq!(transport.acked_replies(), 1);

        channel.close().await;
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_dropping_reply_channel_tears_down_route() {
        let transport = MockTransport::new();
        {
            let _channel = transport
                .open_reply_channel("/replies/r/1", 4)
                .await
                .unwrap();
            assert_eq!(transport.open_reply_channels(), 1);
        }
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_mock_analyzer_echoes_fields() {
        let analyzer = MockAnalyzer::new();
        let extraction = analyzer
            .extract("text", &["genre".to_string()])
            .await
            .unwrap();
        assert_eq!(extraction.fields["genre"], vec!["mock-genre"]);
        assert_eq!(analyzer.calls().len(), 1);
    }
}
