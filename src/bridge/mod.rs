//! Packet decode, gateway stamping, MQTT publish, the MQTT→radio reverse
//! path, and the self-heard-RF correlator that ties a reverse-path send back
//! to its own echo. Ties together `connection`, `traceroute`, `node_cache`
//! and `mqtt` into the one control-flow loop: radio packet in → NodeCache
//! update → TracerouteManager consider → publish.

pub mod decode;
mod envelope;
mod pending;
mod reverse;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::mqtt::{MqttClient, MqttInboundMessage};
use crate::node_cache::NodeCache;
use crate::packet::DecodedPacket;
use crate::shutdown::Shutdown;
use crate::traceroute::TracerouteManager;

use envelope::{build_echo_envelope, build_gateway_envelope, GatewayContext};
use pending::PendingSendTable;

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub root_topic: String,
    /// How long a reverse-path send waits for its own RF echo before the
    /// fallback publish fires.
    pub pending_timeout: Duration,
    /// How often the fallback-echo sweep checks for expired pending sends.
    pub pending_sweep_interval: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            root_topic: "msh/US/NH/".to_string(),
            pending_timeout: Duration::from_secs(2),
            pending_sweep_interval: Duration::from_millis(250),
        }
    }
}

pub struct Bridge {
    connection: Arc<ConnectionManager>,
    node_cache: Arc<NodeCache>,
    traceroute: Arc<TracerouteManager>,
    mqtt: Arc<MqttClient>,
    pending: PendingSendTable,
    settings: BridgeSettings,
    shutdown: Shutdown,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    pub fn spawn(
        connection: Arc<ConnectionManager>,
        node_cache: Arc<NodeCache>,
        traceroute: Arc<TracerouteManager>,
        mqtt: Arc<MqttClient>,
        settings: BridgeSettings,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            connection,
            node_cache,
            traceroute,
            mqtt,
            pending: PendingSendTable::new(),
            settings,
            shutdown: shutdown.clone(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let ingress_task = tokio::spawn({
            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            async move { bridge.run_radio_ingress(shutdown).await }
        });
        let reverse_task = tokio::spawn({
            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            async move { bridge.run_mqtt_reverse(shutdown).await }
        });
        let sweep_task = tokio::spawn({
            let bridge = bridge.clone();
            let shutdown = shutdown.clone();
            async move { bridge.run_pending_sweep(shutdown).await }
        });
        *bridge.tasks.lock().expect("mutex poisoned") = vec![ingress_task, reverse_task, sweep_task];

        bridge
    }

    async fn run_radio_ingress(self: Arc<Self>, shutdown: Shutdown) {
        let mut packets = self.connection.radio().packets();
        loop {
            match shutdown.race(packets.recv()).await {
                None => return,
                Some(Ok(packet)) => self.handle_radio_packet(packet).await,
                Some(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    warn!(skipped = n, "radio packet receiver lagged, dropping backlog");
                }
                Some(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return,
            }
        }
    }

    async fn handle_radio_packet(&self, packet: DecodedPacket) {
        self.connection.packet_received();

        let is_new = self.node_cache.update_from_packet(&packet).await;
        if let Some(from_id) = packet.from_id() {
            self.traceroute
                .process_packet_for_traceroutes(from_id, is_new)
                .await;
        }

        self.try_correlate_self_echo(&packet).await;

        let ctx = self.gateway_context().await;
        let envelope = build_gateway_envelope(&packet, &ctx);
        let Some(from_id) = packet.from_id() else {
            return;
        };
        self.publish(&format!("{}/{}", self.settings.root_topic, from_id), &envelope)
            .await;
    }

    /// If this packet is our own gateway's text message echoing back over
    /// RF and it matches a pending reverse-path send, publish the
    /// correlated echo (real id/rxTime) and remove the pending entry so the
    /// fallback sweep never fires for it.
    async fn try_correlate_self_echo(&self, packet: &DecodedPacket) {
        let gateway_id = self.gateway_id().await;
        if packet.from_id() != Some(gateway_id.as_str()) {
            return;
        }
        if packet.portnum() != Some("TEXT_MESSAGE_APP") {
            return;
        }
        let Some(text) = packet.payload_text() else {
            return;
        };
        let to_id = packet.to_id().map(str::to_string);
        let Some(_pending) = self.pending.take(&text, to_id.as_deref()) else {
            return;
        };
        let id = packet.packet_id().unwrap_or(0);
        let rx_time = packet.rx_time().unwrap_or(0);
        let echo = build_echo_envelope(id, &gateway_id, to_id.as_deref(), rx_time, &text, &gateway_id, 0);
        self.publish(&format!("{}/{}", self.settings.root_topic, gateway_id), &echo)
            .await;
    }

    async fn run_mqtt_reverse(self: Arc<Self>, shutdown: Shutdown) {
        let mut inbound = self.mqtt.inbound_messages();
        loop {
            match shutdown.race(inbound.recv()).await {
                None => return,
                Some(Ok(message)) => self.handle_mqtt_inbound(message).await,
                Some(Err(tokio::sync::broadcast::error::RecvError::Lagged(n))) => {
                    warn!(skipped = n, "mqtt inbound receiver lagged, dropping backlog");
                }
                Some(Err(tokio::sync::broadcast::error::RecvError::Closed)) => return,
            }
        }
    }

    async fn handle_mqtt_inbound(&self, message: MqttInboundMessage) {
        let Some((text, to)) = reverse::parse_reverse_payload(&message.payload) else {
            return;
        };
        let Some(radio) = self.connection.get_ready_interface().await else {
            warn!("reverse-path send dropped, no ready radio interface");
            return;
        };
        if let Err(e) = reverse::send_dual_channel(&radio, &self.pending, &text, to.as_deref()).await {
            warn!(error = %e, "reverse-path send failed");
        }
    }

    /// Fallback-echo timer: anything still pending past `pending_timeout`
    /// gets published with its locally generated packet id instead of a
    /// correlated one.
    async fn run_pending_sweep(self: Arc<Self>, shutdown: Shutdown) {
        loop {
            if !shutdown.sleep(self.settings.pending_sweep_interval).await {
                return;
            }
            let expired = self.pending.take_expired(self.settings.pending_timeout);
            if expired.is_empty() {
                continue;
            }
            let gateway_id = self.gateway_id().await;
            for ((text, to), entry) in expired {
                let rx_time = chrono::Utc::now().timestamp();
                let echo = build_echo_envelope(
                    entry.local_packet_id,
                    &gateway_id,
                    to.as_deref(),
                    rx_time,
                    &text,
                    &gateway_id,
                    0,
                );
                self.publish(&format!("{}/{}", self.settings.root_topic, gateway_id), &echo)
                    .await;
            }
        }
    }

    async fn gateway_id(&self) -> String {
        let info = self.connection.connection_info().await;
        if let Some(id) = info.connected_node_id {
            return id;
        }
        if let Some(id) = self.connection.radio().my_node_id() {
            return id;
        }
        "unknown".to_string()
    }

    async fn gateway_context(&self) -> GatewayContext {
        let gateway_id = self.gateway_id().await;
        let lora = self.connection.radio().lora_config();
        GatewayContext {
            gateway_id,
            modem_preset: lora
                .as_ref()
                .map(|l| l.modem_preset.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            channel_num: lora.map(|l| l.channel_num).unwrap_or(0),
        }
    }

    async fn publish(&self, topic: &str, envelope: &serde_json::Value) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to serialise envelope, dropping");
                return;
            }
        };
        if let Err(e) = self.mqtt.publish(topic, payload).await {
            warn!(error = %e, topic, "failed to publish envelope");
        }
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("mutex poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        info!("bridge closed");
    }
}
