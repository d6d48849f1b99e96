//! CLI/environment configuration, replacing the Python `EnvDefault` argparse
//! action with clap's native env-fallback support (flag > env var > default).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--node-ip (or NODE_IP) is required when --connection-type=tcp")]
    MissingNodeIp,
    #[error("--serial-port (or SERIAL_PORT) is required when --connection-type=serial")]
    MissingSerialPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConnectionType {
    Tcp,
    Serial,
}

#[derive(Debug, Parser)]
#[command(name = "meshtastic-mqtt-bridge", version, about)]
pub struct Config {
    /// MQTT broker host
    #[arg(long, env = "MQTT_ENDPOINT", default_value = "mqtt.nhmesh.live")]
    pub broker: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    /// Root publish topic
    #[arg(long, env = "MQTT_TOPIC", default_value = "msh/US/NH/")]
    pub topic: String,

    /// TLS flag (reserved)
    #[arg(long, default_value_t = false)]
    pub tls: bool,

    /// MQTT username
    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD")]
    pub password: Option<String>,

    /// Radio TCP host (required if connection-type=tcp)
    #[arg(long = "node-ip", env = "NODE_IP")]
    pub node_ip: Option<String>,

    /// Serial device path (required if connection-type=serial)
    #[arg(long = "serial-port", env = "SERIAL_PORT")]
    pub serial_port: Option<String>,

    /// tcp | serial
    #[arg(long = "connection-type", env = "CONNECTION_TYPE", value_enum, default_value_t = ConnectionType::Tcp)]
    pub connection_type: ConnectionType,

    /// Global cooldown between any two traceroute sends, seconds
    #[arg(long = "traceroute-cooldown", env = "TRACEROUTE_COOLDOWN", default_value_t = 180)]
    pub traceroute_cooldown: u64,

    /// Per-node refresh interval, seconds
    #[arg(long = "traceroute-interval", env = "TRACEROUTE_INTERVAL", default_value_t = 43_200)]
    pub traceroute_interval: u64,

    /// Per-node retry cap
    #[arg(long = "traceroute-max-retries", env = "TRACEROUTE_MAX_RETRIES", default_value_t = 3)]
    pub traceroute_max_retries: u32,

    /// Backoff cap, seconds
    #[arg(long = "traceroute-max-backoff", env = "TRACEROUTE_MAX_BACKOFF", default_value_t = 86_400)]
    pub traceroute_max_backoff: u64,

    /// Traceroute retry-state path
    #[arg(
        long = "traceroute-persistence-file",
        env = "TRACEROUTE_PERSISTENCE_FILE",
        default_value = "/tmp/traceroute_state.json"
    )]
    pub traceroute_persistence_file: PathBuf,

    /// Reverse path topic (optional)
    #[arg(long = "mqtt-listen-topic", env = "MQTT_LISTEN_TOPIC")]
    pub mqtt_listen_topic: Option<String>,

    /// Optional read-only status endpoint, e.g. 127.0.0.1:8080 (off by default)
    #[arg(long = "status-addr", env = "STATUS_ADDR")]
    pub status_addr: Option<String>,
}

impl Config {
    /// Parses argv/env and validates cross-field invariants that `clap`
    /// can't express declaratively (node-ip XOR serial-port, gated by
    /// connection-type).
    pub fn resolve() -> Result<Self, ConfigError> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.connection_type {
            ConnectionType::Tcp if self.node_ip.is_none() => Err(ConfigError::MissingNodeIp),
            ConnectionType::Serial if self.serial_port.is_none() => {
                Err(ConfigError::MissingSerialPort)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::parse_from(args)
    }

    #[test]
    fn tcp_without_node_ip_fails_validation() {
        let config = parse(&["bridge", "--connection-type", "tcp"]);
        assert!(matches!(config.validate(), Err(ConfigError::MissingNodeIp)));
    }

    #[test]
    fn tcp_with_node_ip_validates() {
        let config = parse(&["bridge", "--connection-type", "tcp", "--node-ip", "10.0.0.5"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn serial_without_port_fails_validation() {
        let config = parse(&["bridge", "--connection-type", "serial"]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSerialPort)
        ));
    }

    #[test]
    fn defaults_match_expected_values() {
        let config = parse(&["bridge", "--node-ip", "10.0.0.5"]);
        assert_eq!(config.broker, "mqtt.nhmesh.live");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "msh/US/NH/");
        assert_eq!(config.traceroute_cooldown, 180);
        assert_eq!(config.traceroute_interval, 43_200);
        assert_eq!(config.traceroute_max_retries, 3);
        assert_eq!(config.traceroute_max_backoff, 86_400);
    }
}
