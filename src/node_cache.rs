//! In-memory map of nodes learned from radio traffic.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::trace;

use crate::packet::DecodedPacket;

#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub long_name: Option<String>,
    pub position: Option<NodePosition>,
    pub last_seen: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodePosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: Option<f64>,
}

/// Single-writer map of everything learned about each node so far. Readers
/// may observe stale values; that's an accepted tradeoff, not a bug.
#[derive(Default, Debug)]
pub struct NodeCache {
    nodes: RwLock<HashMap<String, NodeInfo>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the cache from a decoded packet. Returns `true` iff the
    /// sender's NodeId had not been seen before this call.
    pub async fn update_from_packet(&self, packet: &DecodedPacket) -> bool {
        let Some(node_id) = packet.from_id() else {
            return false;
        };

        let mut nodes = self.nodes.write().await;
        let is_new = !nodes.contains_key(node_id);
        let entry = nodes.entry(node_id.to_string()).or_insert_with(|| NodeInfo {
            long_name: None,
            position: None,
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();

        match packet.portnum() {
            Some("POSITION_APP") => {
                if let Some(pos) = packet.position() {
                    entry.position = Some(NodePosition {
                        latitude: pos.latitude,
                        longitude: pos.longitude,
                        altitude_meters: pos.altitude_meters,
                    });
                } else {
                    trace!(node_id, "position port with unparseable payload, skipping");
                }
            }
            Some("NODEINFO_APP") => {
                if let Some(name) = packet.user_long_name() {
                    entry.long_name = Some(name);
                }
            }
            _ => {}
        }

        is_new
    }

    pub async fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.read().await.get(node_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packet(value: serde_json::Value) -> DecodedPacket {
        DecodedPacket::from_map(value.as_object().unwrap().clone())
    }

    #[tokio::test]
    async fn first_packet_from_node_is_new() {
        let cache = NodeCache::new();
        let p = packet(json!({ "fromId": "!abcd1234", "decoded": {} }));
        assert!(cache.update_from_packet(&p).await);
        assert!(!cache.update_from_packet(&p).await);
    }

    #[tokio::test]
    async fn missing_from_id_never_registers() {
        let cache = NodeCache::new();
        let p = packet(json!({ "decoded": {} }));
        assert!(!cache.update_from_packet(&p).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn position_packet_populates_position() {
        let cache = NodeCache::new();
        let p = packet(json!({
            "fromId": "!abcd1234",
            "decoded": {
                "portnum": "POSITION_APP",
                "position": { "latitude_i": 420_000_000i64, "longitude_i": -710_000_000i64 }
            }
        }));
        cache.update_from_packet(&p).await;
        let info = cache.get("!abcd1234").await.unwrap();
        let pos = info.position.unwrap();
        assert!((pos.latitude - 42.0).abs() < 1e-9);
        assert!((pos.longitude - (-71.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn user_packet_populates_long_name() {
        let cache = NodeCache::new();
        let p = packet(json!({
            "fromId": "!abcd1234",
            "decoded": { "portnum": "NODEINFO_APP", "user": { "longName": "Base Station" } }
        }));
        cache.update_from_packet(&p).await;
        let info = cache.get("!abcd1234").await.unwrap();
        assert_eq!(info.long_name.as_deref(), Some("Base Station"));
    }
}
