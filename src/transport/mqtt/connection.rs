//! Connection state and option handling for the MQTT transport.

use crate::config::BrokerSection;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// Connection state for the MQTT client.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect.
    Connecting,
    /// Successfully connected and ready for operations.
    Connected,
    /// Disconnected with reason. The event loop keeps polling, which retries
    /// the connection.
    Disconnected(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
        }
    }
}

/// Build MQTT options from the broker config section.
///
/// Manual acks are enabled: a work delivery is only acknowledged once the
/// pipeline has parsed it, and reply deliveries once the owning call has
/// consumed them.
pub fn configure_mqtt_options(
    worker_id: &str,
    config: &BrokerSection,
) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per connection attempt to prevent broker conflicts
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let client_id = format!("worker-{worker_id}-{timestamp}");
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    // Large analyzed texts flow through replies; the default packet limit is
    // too small for them.
    mqtt_options.set_max_packet_size(Some(256 * 1024));
    mqtt_options.set_manual_acks(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_broker_config() -> BrokerSection {
        BrokerSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            exchange: "gpt".to_string(),
            work_routing_key: "extract.request".to_string(),
            storage_exchange: "db-crud".to_string(),
            max_queue_depth: 10,
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_broker_config();
        assert!(configure_mqtt_options("test-worker", &config).is_ok());
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_broker_config();
        config.broker_url = "not-a-url".to_string();

        let result = configure_mqtt_options("test-worker", &config);
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Disconnected("io error".to_string()).to_string(),
            "disconnected (io error)"
        );
    }
}
