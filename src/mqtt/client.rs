//! Thin wrapper around rumqttc's `AsyncClient`/`EventLoop` pair: drives the
//! event loop on a background task, republishes inbound messages and
//! connection transitions as broadcast channels, and backs off between
//! poll errors the way the original producer's `_on_mqtt_disconnect` did.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::shutdown::Shutdown;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const INBOUND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttConnectionEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct MqttInboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Reserved; TLS transport is not wired up yet.
    pub tls: bool,
    pub listen_topic: Option<String>,
    pub keep_alive: Duration,
}

pub struct MqttClient {
    client: AsyncClient,
    listen_topic: Option<String>,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    event_tx: broadcast::Sender<MqttConnectionEvent>,
    inbound_tx: broadcast::Sender<MqttInboundMessage>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Builds the client, spawns the event-loop driver task, and returns
    /// immediately; the underlying TCP connect happens on the first poll.
    pub fn spawn(settings: MqttSettings, shutdown: Shutdown) -> Arc<Self> {
        let mut options = MqttOptions::new(settings.client_id.clone(), settings.broker.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let (Some(user), Some(pass)) = (settings.username.clone(), settings.password.clone()) {
            options.set_credentials(user, pass);
        }
        if settings.tls {
            warn!("tls requested but not implemented; connecting in plaintext");
        }

        let (client, event_loop) = AsyncClient::new(options, INBOUND_CHANNEL_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);

        let mqtt_client = Arc::new(Self {
            client,
            listen_topic: settings.listen_topic,
            connected: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            event_tx,
            inbound_tx,
            task: AsyncMutex::new(None),
        });

        let task = {
            let mqtt_client = mqtt_client.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { mqtt_client.run_event_loop(event_loop, shutdown).await })
        };
        mqtt_client
            .task
            .try_lock()
            .expect("no contention during spawn")
            .replace(task);

        mqtt_client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn connection_events(&self) -> broadcast::Receiver<MqttConnectionEvent> {
        self.event_tx.subscribe()
    }

    pub fn inbound_messages(&self) -> broadcast::Receiver<MqttInboundMessage> {
        self.inbound_tx.subscribe()
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Stops the event-loop task; does not attempt a final flush since
    /// rumqttc has no synchronous disconnect-and-drain primitive.
    pub async fn disconnect(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = self.client.disconnect().await;
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut event_loop: rumqttc::EventLoop, shutdown: Shutdown) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match shutdown.race(event_loop.poll()).await {
                None => return,
                Some(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    let _ = self.event_tx.send(MqttConnectionEvent::Connected);
                    info!("connected to mqtt broker");
                    if let Some(topic) = &self.listen_topic {
                        match self.client.subscribe(topic, QoS::AtLeastOnce).await {
                            Ok(_) => info!(topic, "subscribed to reverse-path listen topic"),
                            Err(e) => warn!(error = %e, topic, "failed to subscribe to listen topic"),
                        }
                    }
                }
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    let _ = self.inbound_tx.send(MqttInboundMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    if self.connected.swap(false, Ordering::SeqCst) {
                        let _ = self.event_tx.send(MqttConnectionEvent::Disconnected);
                    }
                    if shutdown.is_cancelled() {
                        return;
                    }
                    let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = backoff_delay(attempt);
                    warn!(error = %describe(&e), attempt, delay_secs = delay.as_secs(), "mqtt event loop error, backing off before next poll");
                    if !shutdown.sleep(delay).await {
                        return;
                    }
                }
            }
        }
    }
}

fn describe(err: &ConnectionError) -> String {
    err.to_string()
}

/// `min(5 * 2^(attempt-1), 60)` seconds, mirroring the original producer's
/// MQTT reconnect backoff. Unlike the original, attempts are never capped:
/// a long-running bridge keeps retrying at the 60s ceiling rather than
/// giving up on MQTT connectivity for good.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_secs(5).saturating_mul(1u32 << exponent);
    delay.min(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(5), Duration::from_secs(60));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }
}
