//! Correlated request/reply calls over the transport.
//!
//! Each call gets a fresh correlation token and its own reply destination, so
//! concurrent calls never share a listener. The reply subscription is torn
//! down on every completion path: match, failure reply, transport error, or
//! deadline.

use crate::error::{WorkerError, WorkerResult};
use crate::protocol::{ReplyEnvelope, TopicBuilder};
use crate::transport::{MessageProperties, ReplyChannel, Transport, TransportError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Replies buffered per call before the router drops extras. A call only
/// ever expects one matching reply; the headroom absorbs stale cross-talk.
const REPLY_CHANNEL_CAPACITY: usize = 8;

/// One outbound request to a downstream service.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
}

impl CallRequest {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
        }
    }
}

/// Request/reply client over a [`Transport`].
///
/// `call` publishes one request and waits for the reply carrying the call's
/// own correlation token, up to the configured deadline. Replies carrying a
/// foreign token are acknowledged and logged, and the call keeps waiting.
pub struct CorrelatedClient<T: Transport> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: Transport> CorrelatedClient<T> {
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform one correlated call and return the parsed reply envelope.
    ///
    /// A reply with `success: false` is an error (`CallFailed`), not an
    /// envelope the caller has to inspect.
    pub async fn call(&self, request: CallRequest) -> WorkerResult<ReplyEnvelope> {
        let token = Uuid::new_v4().to_string();
        let reply_topic = TopicBuilder::reply_topic(&request.routing_key);
        let request_topic = TopicBuilder::request_topic(&request.exchange, &request.routing_key);

        let channel = self
            .transport
            .open_reply_channel(&reply_topic, REPLY_CHANNEL_CAPACITY)
            .await
            .map_err(|source| self.transport_error(&request, source))?;

        debug!(
            target: "rpc",
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            correlation = %token,
            reply_topic = %reply_topic,
            "Issuing correlated call"
        );

        let payload = match serde_json::to_vec(&request.payload) {
            Ok(payload) => payload,
            Err(e) => {
                channel.close().await;
                return Err(
                    self.transport_error(&request, TransportError::SerializationError(e))
                );
            }
        };

        if let Err(source) = self
            .transport
            .publish(
                &request_topic,
                payload,
                MessageProperties::correlated(&reply_topic, &token),
            )
            .await
        {
            channel.close().await;
            return Err(self.transport_error(&request, source));
        }

        self.await_reply(&request, &token, channel).await
    }

    /// Wait for the matching reply until the deadline. The channel is closed
    /// before this returns, on every path.
    async fn await_reply(
        &self,
        request: &CallRequest,
        token: &str,
        mut channel: ReplyChannel,
    ) -> WorkerResult<ReplyEnvelope> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let mut delivery = match tokio::time::timeout_at(deadline, channel.recv()).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    // Router dropped our sender: the transport is tearing
                    // down underneath us.
                    channel.close().await;
                    return Err(self.transport_error(
                        request,
                        TransportError::NotConnected {
                            state: "reply channel closed".to_string(),
                        },
                    ));
                }
                Err(_) => {
                    channel.close().await;
                    return Err(WorkerError::CallTimeout {
                        exchange: request.exchange.clone(),
                        routing_key: request.routing_key.clone(),
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
            };

            let received = delivery
                .properties
                .correlation_id
                .clone()
                .unwrap_or_default();

            if received != token {
                // Stale or cross-talk reply. Consume it so the broker does
                // not redeliver, and keep waiting for our own.
                let mismatch = WorkerError::CallMismatch {
                    exchange: request.exchange.clone(),
                    routing_key: request.routing_key.clone(),
                    expected: token.to_string(),
                    received,
                };
                warn!(target: "rpc", error = %mismatch, "Ignoring mismatched reply");
                if let Err(e) = delivery.ack().await {
                    warn!(target: "rpc", error = %e, "Failed to ack mismatched reply");
                }
                continue;
            }

            if let Err(e) = delivery.ack().await {
                warn!(target: "rpc", error = %e, "Failed to ack matched reply");
            }

            let envelope: ReplyEnvelope = match serde_json::from_slice(&delivery.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    channel.close().await;
                    return Err(
                        self.transport_error(request, TransportError::SerializationError(e))
                    );
                }
            };

            channel.close().await;

            if !envelope.success {
                return Err(WorkerError::CallFailed {
                    exchange: request.exchange.clone(),
                    routing_key: request.routing_key.clone(),
                    message: envelope
                        .message
                        .unwrap_or_else(|| "downstream service reported failure".to_string()),
                });
            }

            debug!(
                target: "rpc",
                exchange = %request.exchange,
                routing_key = %request.routing_key,
                correlation = %token,
                "Correlated call completed"
            );
            return Ok(envelope);
        }
    }

    fn transport_error(&self, request: &CallRequest, source: TransportError) -> WorkerError {
        WorkerError::CallTransport {
            exchange: request.exchange.clone(),
            routing_key: request.routing_key.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockReply, MockTransport};
    use serde_json::json;

    fn client(transport: &Arc<MockTransport>, timeout_ms: u64) -> CorrelatedClient<MockTransport> {
        CorrelatedClient::new(transport.clone(), Duration::from_millis(timeout_ms))
    }

    fn cost_request() -> CallRequest {
        CallRequest::new("db-crud", "records.cost", json!({"source": "lib1"}))
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder(|request| {
            vec![MockReply::matching(
                request,
                json!({"success": true, "message": "stored"}),
            )]
        });

        let envelope = client(&transport, 1_000).call(cost_request()).await.unwrap();
        assert!(envelope.success);
        assert_eq!(envelope.message.as_deref(), Some("stored"));

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/exchanges/db-crud/records.cost");
        let reply_to = published[0].properties.reply_to.as_deref().unwrap();
        assert!(reply_to.starts_with("/replies/records.cost/"));
        assert!(published[0].properties.correlation_id.is_some());

        assert_eq!(transport.open_reply_channels(), 0);
        assert_eq!(transport.acked_replies(), 1);
    }

    #[tokio::test]
    async fn test_each_call_uses_fresh_token_and_reply_topic() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder(|request| {
            vec![MockReply::matching(request, json!({"success": true}))]
        });

        let client = client(&transport, 1_000);
        client.call(cost_request()).await.unwrap();
        client.call(cost_request()).await.unwrap();

        let published = transport.published();
        assert_ne!(
            published[0].properties.correlation_id,
            published[1].properties.correlation_id
        );
        assert_ne!(published[0].properties.reply_to, published[1].properties.reply_to);
    }

    #[tokio::test]
    async fn test_failure_reply_is_call_failed() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder(|request| {
            vec![MockReply::matching(
                request,
                json!({"success": false, "message": "write rejected"}),
            )]
        });

        let result = client(&transport, 1_000).call(cost_request()).await;
        match result {
            Err(WorkerError::CallFailed {
                exchange,
                routing_key,
                message,
            }) => {
                assert_eq!(exchange, "db-crud");
                assert_eq!(routing_key, "records.cost");
                assert_eq!(message, "write rejected");
            }
            other => panic!("expected CallFailed, got {other:?}"),
        }
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_no_reply_times_out_and_tears_down() {
        let transport = Arc::new(MockTransport::new());

        let result = client(&transport, 50).call(cost_request()).await;
        assert!(matches!(result, Err(WorkerError::CallTimeout { .. })));
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_mismatched_reply_is_consumed_and_call_keeps_waiting() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder(|request| {
            vec![
                MockReply {
                    correlation_id: "someone-elses-token".to_string(),
                    payload: json!({"success": true, "message": "not yours"}),
                },
                MockReply::matching(request, json!({"success": true, "message": "yours"})),
            ]
        });

        let envelope = client(&transport, 1_000).call(cost_request()).await.unwrap();
        assert_eq!(envelope.message.as_deref(), Some("yours"));
        // Both the stale reply and the matching one were consumed.
        assert_eq!(transport.acked_replies(), 2);
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_only_mismatched_replies_still_time_out() {
        let transport = Arc::new(MockTransport::new());
        transport.set_responder(|_| {
            vec![MockReply {
                correlation_id: "foreign".to_string(),
                payload: json!({"success": true}),
            }]
        });

        let result = client(&transport, 50).call(cost_request()).await;
        assert!(matches!(result, Err(WorkerError::CallTimeout { .. })));
        assert_eq!(transport.acked_replies(), 1);
        assert_eq!(transport.open_reply_channels(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_closes_channel() {
        let transport = Arc::new(MockTransport::new());
        transport.fail_next_publish();

        let result = client(&transport, 1_000).call(cost_request()).await;
        assert!(matches!(result, Err(WorkerError::CallTransport { .. })));
        assert_eq!(transport.open_reply_channels(), 0);
    }
}
