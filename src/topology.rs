//! Broker topology provisioning.
//!
//! Declares the worker's inbound work subscription and hands back the
//! bounded inbox the pipeline consumes. The inbox capacity is the local
//! queue depth; when it is full, further deliveries stay with the broker
//! until a slot frees up.

use crate::config::BrokerSection;
use crate::protocol::TopicBuilder;
use crate::transport::{Delivery, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::info;

/// Subscribe the work queue. Failure here is fatal at startup: a worker
/// without its work subscription can never do anything.
pub async fn provision<T: Transport>(
    transport: &T,
    config: &BrokerSection,
) -> Result<mpsc::Receiver<Delivery>, TransportError> {
    let topic = TopicBuilder::work_topic(&config.exchange, &config.work_routing_key);
    let (sender, receiver) = mpsc::channel(config.max_queue_depth);

    transport.subscribe_work(&topic, sender).await?;
    info!(
        topic = %topic,
        max_queue_depth = config.max_queue_depth,
        "Work subscription established"
    );

    Ok(receiver)
}
