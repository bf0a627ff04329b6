//! MQTT implementation of the transport layer.

mod client;
mod connection;

pub use client::MqttClient;
pub use connection::{configure_mqtt_options, ConnectionState};
