//! Persistence pipeline.
//!
//! One work item flows through: parse, validate, analyze, then three
//! sequential persistence calls (cost accounting, conversation history,
//! metadata), then a reply to the originator. The first failing step aborts
//! the rest; the originator always hears back once the item parsed.

use crate::config::PipelineSection;
use crate::error::{WorkerError, WorkerResult};
use crate::llm::Analyzer;
use crate::observability::WorkerStatus;
use crate::protocol::{
    ChatTurn, ConversationRecord, CostRecord, MetadataPayload, MetadataRecord, ReplyEnvelope,
    TokenUsage, WorkItem,
};
use crate::reporter::ErrorReporter;
use crate::rpc::{CallRequest, CorrelatedClient};
use crate::transport::{Delivery, MessageProperties, Transport, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drives work items through analysis, persistence, and reply.
pub struct Orchestrator<T: Transport> {
    worker_id: String,
    storage_exchange: String,
    settings: PipelineSection,
    transport: Arc<T>,
    client: CorrelatedClient<T>,
    analyzer: Arc<dyn Analyzer>,
    reporter: Arc<ErrorReporter>,
    status: Arc<WorkerStatus>,
}

impl<T: Transport + 'static> Orchestrator<T> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        storage_exchange: String,
        settings: PipelineSection,
        transport: Arc<T>,
        analyzer: Arc<dyn Analyzer>,
        reporter: Arc<ErrorReporter>,
        status: Arc<WorkerStatus>,
    ) -> Self {
        let client = CorrelatedClient::new(
            transport.clone(),
            Duration::from_secs(settings.call_timeout_secs),
        );
        Self {
            worker_id,
            storage_exchange,
            settings,
            transport,
            client,
            analyzer,
            reporter,
            status,
        }
    }

    /// Consume work deliveries until the inbox closes. Each item is handled
    /// on its own task so a slow persistence call does not stall the queue.
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::Receiver<Delivery>) {
        info!(worker = %self.worker_id, "Pipeline started");
        while let Some(delivery) = inbox.recv().await {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.handle_delivery(delivery).await;
            });
        }
        info!(worker = %self.worker_id, "Pipeline inbox closed, stopping");
    }

    /// Process one delivery end to end.
    ///
    /// Structurally malformed payloads are consumed and dropped without a
    /// reply; there is no usable reply address in a message we cannot parse
    /// beyond its transport properties, and answering them would only feed
    /// garbage back. Everything after a successful parse replies to the
    /// originator, success or failure.
    pub async fn handle_delivery(&self, mut delivery: Delivery) {
        let origin = delivery.properties.clone();

        let item: WorkItem = match serde_json::from_slice(&delivery.payload) {
            Ok(item) => item,
            Err(e) => {
                warn!(topic = %delivery.topic, error = %e, "Dropping malformed work item");
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "Failed to ack malformed work item");
                }
                let error = WorkerError::validation(format!("malformed work item: {e}"));
                self.reporter
                    .report(&error.to_record(&self.worker_id, None))
                    .await;
                return;
            }
        };

        // The item is ours once it parses; redelivery after this point would
        // double-charge and double-store.
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Failed to ack work item");
        }

        debug!(
            source = %item.source,
            conversation = %item.conversation_id,
            fields = item.fields.len(),
            "Work item accepted"
        );

        let result = self.process(&item).await;
        match result {
            Ok(envelope) => {
                info!(
                    source = %item.source,
                    conversation = %item.conversation_id,
                    "Work item completed"
                );
                self.reply(&origin, &envelope).await;
            }
            Err(error) => {
                warn!(
                    source = %item.source,
                    conversation = %item.conversation_id,
                    kind = error.kind(),
                    error = %error,
                    "Work item failed"
                );
                self.reporter
                    .report(&error.to_record(&self.worker_id, Some(&item)))
                    .await;
                self.reply(&origin, &ReplyEnvelope::failure(error.to_string()))
                    .await;
            }
        }

        self.status.mark_item_processed();
    }

    /// Analysis plus the three persistence calls, aborting on first failure.
    async fn process(&self, item: &WorkItem) -> WorkerResult<ReplyEnvelope> {
        item.validate().map_err(WorkerError::validation)?;

        let extraction = self.analyzer.extract(&item.text, &item.fields).await?;
        debug!(
            conversation = %item.conversation_id,
            model = %extraction.usage.model,
            input_tokens = extraction.usage.input_tokens,
            output_tokens = extraction.usage.output_tokens,
            "Analysis completed"
        );

        self.record_cost(item, &extraction.usage).await?;
        self.record_conversation(item).await?;
        self.record_metadata(item, &extraction.fields).await?;

        let mut envelope = ReplyEnvelope::success("analysis recorded");
        envelope.extra.insert(
            "fields".to_string(),
            serde_json::to_value(&extraction.fields)
                .map_err(|e| WorkerError::Transport(TransportError::SerializationError(e)))?,
        );
        Ok(envelope)
    }

    async fn record_cost(&self, item: &WorkItem, usage: &TokenUsage) -> WorkerResult<()> {
        let record = CostRecord {
            source: item.source.clone(),
            conversation_id: item.conversation_id.clone(),
            tokens: usage.clone(),
        };
        self.storage_call(&self.settings.cost_routing_key, &record)
            .await
    }

    async fn record_conversation(&self, item: &WorkItem) -> WorkerResult<()> {
        let record = ConversationRecord {
            source: item.source.clone(),
            conversation_id: item.conversation_id.clone(),
            turn: ChatTurn::client(item.text.clone()),
        };
        self.storage_call(&self.settings.conversation_routing_key, &record)
            .await
    }

    async fn record_metadata(
        &self,
        item: &WorkItem,
        fields: &HashMap<String, Vec<String>>,
    ) -> WorkerResult<()> {
        let payload = MetadataPayload {
            source: item.source.clone(),
            conversation_id: item.conversation_id.clone(),
            base: MetadataRecord::from_fields(fields),
        };
        self.storage_call(&self.settings.metadata_routing_key, &payload)
            .await
    }

    async fn storage_call<P: serde::Serialize>(
        &self,
        routing_key: &str,
        payload: &P,
    ) -> WorkerResult<()> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| WorkerError::Transport(TransportError::SerializationError(e)))?;
        self.client
            .call(CallRequest::new(
                self.storage_exchange.clone(),
                routing_key,
                payload,
            ))
            .await?;
        debug!(routing_key, "Persistence call completed");
        Ok(())
    }

    /// Reply to the work item's originator using the delivery's own reply
    /// address and correlation token.
    async fn reply(&self, origin: &MessageProperties, envelope: &ReplyEnvelope) {
        let Some(reply_to) = &origin.reply_to else {
            warn!("Work item carried no reply destination, dropping reply");
            return;
        };

        let payload = match serde_json::to_vec(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize reply envelope");
                return;
            }
        };

        let properties = MessageProperties {
            reply_to: None,
            correlation_id: origin.correlation_id.clone(),
        };
        if let Err(e) = self.transport.publish(reply_to, payload, properties).await {
            warn!(reply_to = %reply_to, error = %e, "Failed to publish reply");
        }
    }
}
