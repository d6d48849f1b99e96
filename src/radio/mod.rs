//! The radio/MQTT client libraries are external collaborators per the
//! design's scope: this module provides just enough of a concrete
//! Meshtastic TCP/serial client for the rest of the crate to compile and
//! run against — `connect`, `get_my_node_info`, `send_text`,
//! `send_traceroute`, an inbound packet stream, and connection-event
//! notifications. It is deliberately thinner than a production Meshtastic
//! driver (see `proto`'s module doc).

pub mod client;
pub mod proto;

use thiserror::Error;

pub use client::{RadioClient, RadioEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioConfig {
    Tcp { host: String, port: u16 },
    Serial { path: String },
}

impl RadioConfig {
    pub const DEFAULT_TCP_PORT: u16 = 4403;
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("I/O error talking to radio: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("radio did not respond within the expected window")]
    Timeout,
    #[error("not connected")]
    NotConnected,
}

/// Canonical Meshtastic NodeId form: `!<8 hex chars>`.
pub fn node_id_from_num(num: u32) -> String {
    format!("!{:08x}", num)
}

pub fn node_num_from_id(node_id: &str) -> Option<u32> {
    u32::from_str_radix(node_id.strip_prefix('!')?, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_round_trips() {
        let id = node_id_from_num(0xabcd1234);
        assert_eq!(id, "!abcd1234");
        assert_eq!(node_num_from_id(&id), Some(0xabcd1234));
    }

    #[test]
    fn node_num_rejects_missing_bang() {
        assert_eq!(node_num_from_id("abcd1234"), None);
    }
}
