//! MQTT transport client.
//!
//! Wraps the rumqttc v5 async client with a routing event loop. Inbound
//! publishes are demultiplexed through the [`RouteTable`]: the work topic
//! feeds the pipeline's bounded channel, per-call reply topics feed the
//! correlated call that opened them. Replies and requests ride MQTT v5
//! `response_topic` / `correlation_data` properties.

use super::connection::{configure_mqtt_options, ConnectionState};
use crate::config::BrokerSection;
use crate::transport::{
    Acker, Delivery, MessageProperties, ReplyChannel, ReplyChannelCloser, RouteOutcome, RouteTable,
    Transport, TransportError,
};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delay before re-polling after an event loop error; polling again retries
/// the connection.
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// How long `connect` waits for the broker's ConnAck.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT transport client for the extraction worker.
pub struct MqttClient {
    worker_id: String,
    client: AsyncClient,
    // Behind a mutex: EventLoop is Send but not Sync, and the client must
    // stay shareable across tasks. Taken once when the event loop starts.
    event_loop: StdMutex<Option<EventLoop>>,
    routes: Arc<RouteTable>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    event_loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    pub fn new(worker_id: &str, config: &BrokerSection) -> Result<Self, TransportError> {
        let mqtt_options = configure_mqtt_options(worker_id, config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 10);

        Ok(Self {
            worker_id: worker_id.to_string(),
            client,
            event_loop: StdMutex::new(Some(event_loop)),
            routes: Arc::new(RouteTable::default()),
            state_rx: None,
            shutdown_tx: None,
            event_loop_handle: StdMutex::new(None),
        })
    }

    /// Connect to the broker. Only returns once the ConnAck arrives; a
    /// timeout or a broker rejection is a startup failure the caller treats
    /// as fatal.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        let event_loop = self
            .event_loop
            .lock()
            .expect("event loop poisoned")
            .take()
            .ok_or_else(|| {
                TransportError::ConnectionFailed("event loop already started".to_string())
            })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state_rx = Some(state_rx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        let worker_id = self.worker_id.clone();
        let client = self.client.clone();
        let routes = self.routes.clone();
        let handle = tokio::spawn(async move {
            info!(worker_id = %worker_id, "Starting MQTT event loop");
            Self::run_event_loop(event_loop, client, routes, state_tx, shutdown_rx).await;
            info!(worker_id = %worker_id, "MQTT event loop stopped");
        });
        *self
            .event_loop_handle
            .lock()
            .expect("event loop handle poisoned") = Some(handle);

        Self::wait_for_connection_confirmation(state_rx, CONNECT_TIMEOUT).await
    }

    /// Watch the connection state, for readiness reporting. `None` before
    /// `connect` has been called.
    pub fn state_watch(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.state_rx.clone()
    }

    async fn run_event_loop(
        mut event_loop: EventLoop,
        client: AsyncClient,
        routes: Arc<RouteTable>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut connected_before = false;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        let _ = state_tx.send(ConnectionState::Connected);
                        if connected_before {
                            Self::resubscribe_active_topics(&client, &routes).await;
                        }
                        connected_before = true;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        Self::handle_publish(&client, &routes, publish).await;
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        let _ = state_tx.send(ConnectionState::Disconnected(
                            "disconnected by broker".to_string(),
                        ));
                    }
                    Ok(other) => {
                        debug!(target: "mqtt_transport", "MQTT event: {:?}", other);
                    }
                    Err(e) => {
                        let _ = state_tx.send(ConnectionState::Disconnected(e.to_string()));
                        error!("MQTT event loop error: {e}");
                        // poll() re-establishes the connection on the next
                        // iteration; pace the retries.
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
    }

    /// Route one inbound publish. Unroutable deliveries (stale replies after
    /// a call completed, messages for closed channels) are logged and acked
    /// so they do not wedge the session; work-channel overflow leaves the
    /// delivery unacknowledged.
    async fn handle_publish(client: &AsyncClient, routes: &RouteTable, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        if publish.retain {
            debug!(target: "mqtt_transport", topic = %topic, "Ignoring retained message");
            let _ = client.ack(&publish).await;
            return;
        }

        let properties = Self::extract_properties(&publish);
        let acker = Box::new(MqttAcker {
            client: client.clone(),
            publish: publish.clone(),
        });
        let delivery = Delivery::new(
            topic.clone(),
            publish.payload.to_vec(),
            properties,
            Some(acker),
        );

        match routes.route(delivery) {
            (RouteOutcome::Work, _) | (RouteOutcome::Reply, _) => {
                debug!(target: "mqtt_transport", topic = %topic, "Routed delivery");
            }
            (RouteOutcome::WorkChannelFull, Some(dropped)) => {
                warn!(
                    topic = %topic,
                    "Work queue depth exceeded; leaving delivery unacknowledged"
                );
                drop(dropped);
            }
            (_, leftover) => {
                warn!(topic = %topic, "No listener for delivery; acknowledging and dropping");
                if let Some(mut delivery) = leftover {
                    if let Err(e) = delivery.ack().await {
                        warn!("Failed to ack unroutable delivery: {e}");
                    }
                }
            }
        }
    }

    fn extract_properties(publish: &Publish) -> MessageProperties {
        let props = publish.properties.as_ref();
        MessageProperties {
            reply_to: props.and_then(|p| p.response_topic.clone()),
            correlation_id: props
                .and_then(|p| p.correlation_data.as_ref())
                .map(|data| String::from_utf8_lossy(data).to_string()),
        }
    }

    async fn resubscribe_active_topics(client: &AsyncClient, routes: &RouteTable) {
        for topic in routes.active_topics() {
            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {topic}: {e}");
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {topic}");
            }
        }
    }

    /// Wait for the connection to be acknowledged, or fail with the reason.
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let wait = async {
            loop {
                match &*state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(TransportError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::ConnectionFailed(
                        "state channel closed".to_string(),
                    ));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailed(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    fn check_connection_state(&self) -> Result<(), TransportError> {
        let state_rx = self.state_rx.as_ref().ok_or(TransportError::NotConnected {
            state: "never connected".to_string(),
        })?;

        let state = state_rx.borrow().clone();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected {
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Disconnect from the broker and stop the event loop.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let handle = self
            .event_loop_handle
            .lock()
            .expect("event loop handle poisoned")
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("MQTT event loop shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT event loop ended with error: {e}"),
                Err(_) => warn!("MQTT event loop did not stop in time, aborting"),
                _ => {}
            }
        }

        info!("MQTT client disconnected");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for MqttClient {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.check_connection_state()?;

        let mut props = PublishProperties::default();
        props.response_topic = properties.reply_to;
        props.correlation_data = properties.correlation_id.map(Bytes::from);

        self.client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, payload, props)
            .await
            .map_err(|e| TransportError::PublishFailed(Box::new(e)))?;

        debug!(target: "mqtt_transport", topic = %topic, "Published message");
        Ok(())
    }

    async fn subscribe_work(
        &self,
        topic: &str,
        sender: mpsc::Sender<Delivery>,
    ) -> Result<(), TransportError> {
        self.routes.set_work_route(topic, sender);
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::SubscriptionFailed(Box::new(e)))?;

        info!(topic = %topic, "Subscribed to work topic");
        Ok(())
    }

    async fn open_reply_channel(
        &self,
        topic: &str,
        capacity: usize,
    ) -> Result<ReplyChannel, TransportError> {
        let (sender, receiver) = mpsc::channel(capacity);
        self.routes.insert_reply_route(topic, sender);

        if let Err(e) = self.client.subscribe(topic, QoS::AtLeastOnce).await {
            self.routes.remove_reply_route(topic);
            return Err(TransportError::SubscriptionFailed(Box::new(e)));
        }

        debug!(target: "mqtt_transport", topic = %topic, "Opened reply channel");
        Ok(ReplyChannel::new(
            topic,
            receiver,
            Box::new(MqttReplyCloser {
                client: self.client.clone(),
                routes: self.routes.clone(),
            }),
        ))
    }

    fn is_connected(&self) -> bool {
        self.state_rx
            .as_ref()
            .map(|rx| *rx.borrow() == ConnectionState::Connected)
            .unwrap_or(false)
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Ok(mut guard) = self.event_loop_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Acknowledges one QoS 1 publish through the shared client.
struct MqttAcker {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait::async_trait]
impl Acker for MqttAcker {
    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| TransportError::AckFailed(Box::new(e)))
    }
}

/// Tears down one per-call reply subscription.
struct MqttReplyCloser {
    client: AsyncClient,
    routes: Arc<RouteTable>,
}

#[async_trait::async_trait]
impl ReplyChannelCloser for MqttReplyCloser {
    async fn close(self: Box<Self>, topic: &str) {
        self.routes.remove_reply_route(topic);
        if let Err(e) = self.client.unsubscribe(topic).await {
            warn!(topic = %topic, "Failed to unsubscribe reply topic: {e}");
        }
    }

    fn abandon(&self, topic: &str) {
        self.routes.remove_reply_route(topic);
    }
}
