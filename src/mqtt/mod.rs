//! MQTT broker session: rumqttc event-loop driver, inbound/outbound channels,
//! and reconnect backoff for the broker link itself (separate from the
//! radio session owned by `connection`).

mod client;

pub use client::{MqttClient, MqttConnectionEvent, MqttError, MqttInboundMessage, MqttSettings};
