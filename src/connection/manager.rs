//! Owns the radio session, publishes a ready handle, and reports connection
//! events. The liveness check combines an event-driven signal, a
//! socket-level peek, and an application heartbeat, and only declares the
//! connection healthy when all three agree.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::radio::{RadioClient, RadioConfig, RadioEvent};
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("broken pipe")]
    BrokenPipe,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("socket error: {0}")]
    SocketError(String),
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionManagerSettings {
    pub health_check_interval: Duration,
    pub packet_timeout: Duration,
    pub heartbeat_freshness_timeout: Duration,
    pub error_threshold: u32,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub min_reconnect_interval: Duration,
}

impl Default for ConnectionManagerSettings {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            packet_timeout: Duration::from_secs(60),
            heartbeat_freshness_timeout: Duration::from_secs(30),
            error_threshold: 3,
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            min_reconnect_interval: Duration::from_secs(30),
        }
    }
}

/// Diagnostic snapshot, used by disconnect/connect log lines and the
/// optional status endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub connected_node_id: Option<String>,
    pub error_count: u32,
}

pub struct ConnectionManager {
    radio: Arc<RadioClient>,
    config: RadioConfig,
    state: AsyncMutex<ConnectionState>,
    reconnecting: AtomicBool,
    connected_node_id: StdMutex<Option<String>>,
    error_count: AtomicU32,
    last_packet_at: StdMutex<Instant>,
    last_heartbeat_ok_at: StdMutex<Instant>,
    last_connect_at: StdMutex<Option<Instant>>,
    settings: ConnectionManagerSettings,
    shutdown: Shutdown,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Builds the manager and spawns its event-listener and health-monitor
    /// tasks. `radio_config` must be exactly one of TCP or serial; `config.rs`
    /// enforces that fail-fast at startup.
    pub fn spawn(
        radio_config: RadioConfig,
        settings: ConnectionManagerSettings,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            radio: RadioClient::new(),
            config: radio_config,
            state: AsyncMutex::new(ConnectionState::Disconnected),
            reconnecting: AtomicBool::new(false),
            connected_node_id: StdMutex::new(None),
            error_count: AtomicU32::new(0),
            last_packet_at: StdMutex::new(Instant::now()),
            last_heartbeat_ok_at: StdMutex::new(Instant::now()),
            last_connect_at: StdMutex::new(None),
            settings,
            shutdown: shutdown.clone(),
            tasks: StdMutex::new(Vec::new()),
        });

        let event_task = tokio::spawn({
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            async move { manager.run_event_listener(shutdown).await }
        });
        let health_task = tokio::spawn({
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            async move { manager.run_health_monitor(shutdown).await }
        });
        *manager.tasks.lock().expect("mutex poisoned") = vec![event_task, health_task];

        manager
    }

    pub fn radio(&self) -> Arc<RadioClient> {
        self.radio.clone()
    }

    /// Establishes a session and verifies it by fetching own-node identity.
    pub async fn connect(&self) -> bool {
        *self.state.lock().await = ConnectionState::Connecting;
        match self.radio.connect(&self.config, self.shutdown.clone()).await {
            Ok(node_id) => {
                *self.connected_node_id.lock().expect("mutex poisoned") = Some(node_id.clone());
                self.error_count.store(0, Ordering::SeqCst);
                *self.last_packet_at.lock().expect("mutex poisoned") = Instant::now();
                *self.last_heartbeat_ok_at.lock().expect("mutex poisoned") = Instant::now();
                *self.last_connect_at.lock().expect("mutex poisoned") = Some(Instant::now());
                *self.state.lock().await = ConnectionState::Connected;
                info!(node_id = %node_id, "connected to radio");
                true
            }
            Err(err) => {
                warn!(error = %err, "failed to connect to radio");
                self.error_count.fetch_add(1, Ordering::SeqCst);
                *self.state.lock().await = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Single-flight exponential-backoff reconnect loop. Returns `false`
    /// immediately if another reconnection sequence is already running.
    pub async fn reconnect(&self) -> bool {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        *self.state.lock().await = ConnectionState::Reconnecting;
        let succeeded = self.reconnect_loop().await;
        self.reconnecting.store(false, Ordering::SeqCst);

        if !succeeded && !self.shutdown.is_cancelled() {
            *self.state.lock().await = ConnectionState::Disconnected;
        }
        succeeded
    }

    async fn reconnect_loop(&self) -> bool {
        for attempt in 1..=self.settings.max_attempts {
            if self.shutdown.is_cancelled() {
                return false;
            }
            self.wait_min_connect_interval().await;
            if self.connect().await {
                return true;
            }
            let delay = self.backoff_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "retrying radio connection");
            if !self.shutdown.sleep(delay).await {
                return false;
            }
        }
        warn!("max reconnection attempts reached");
        false
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.settings.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.settings.max_delay)
    }

    async fn wait_min_connect_interval(&self) {
        let last = *self.last_connect_at.lock().expect("mutex poisoned");
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_reconnect_interval {
                self.shutdown
                    .sleep(self.settings.min_reconnect_interval - elapsed)
                    .await;
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Connected)
    }

    /// Returns the current handle, triggering a reconnect if not connected.
    pub async fn get_ready_interface(&self) -> Option<Arc<RadioClient>> {
        if self.is_connected().await {
            return Some(self.radio.clone());
        }
        if self.reconnect().await {
            Some(self.radio.clone())
        } else {
            None
        }
    }

    /// Resets the packet-inactivity timer; called by the bridge on every
    /// successfully decoded packet.
    pub fn packet_received(&self) {
        *self.last_packet_at.lock().expect("mutex poisoned") = Instant::now();
    }

    /// Marks the session dead after a caller observes a broken-pipe/reset
    /// style error during an operation.
    pub async fn notify_connection_error(&self, err: ConnectionError) {
        warn!(error = %err, "connection error reported");
        self.error_count.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().await = ConnectionState::Disconnected;
    }

    /// Requests immediate reconnection; used by disconnect event subscribers.
    pub async fn handle_external_error(&self, msg: &str) {
        warn!(msg, "external error signal, requesting immediate reconnect");
        *self.state.lock().await = ConnectionState::Disconnected;
        self.reconnect().await;
    }

    pub async fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            state: *self.state.lock().await,
            connected_node_id: self.connected_node_id.lock().expect("mutex poisoned").clone(),
            error_count: self.error_count.load(Ordering::SeqCst),
        }
    }

    /// Idempotent: safe to call more than once, including concurrently with
    /// the process-wide shutdown signal already having fired.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("mutex poisoned"));
        for task in tasks {
            let _ = task.await;
        }
        *self.state.lock().await = ConnectionState::Closed;
        info!("connection manager closed");
    }

    async fn run_event_listener(self: Arc<Self>, shutdown: Shutdown) {
        let mut events = self.radio.connection_events();
        loop {
            match shutdown.race(events.recv()).await {
                None => return,
                Some(Ok(RadioEvent::Lost)) => {
                    self.handle_external_error("radio reported connection lost")
                        .await;
                }
                Some(Ok(RadioEvent::Connected)) => {}
                Some(Err(_)) => return,
            }
        }
    }

    async fn run_health_monitor(self: Arc<Self>, shutdown: Shutdown) {
        loop {
            if !shutdown.sleep(self.settings.health_check_interval).await {
                return;
            }
            self.health_tick().await;
        }
    }

    async fn health_tick(&self) {
        let disconnected = !self.is_connected().await;
        let error_heavy = self.error_count.load(Ordering::SeqCst) >= self.settings.error_threshold;
        let packet_stale = self.last_packet_at.lock().expect("mutex poisoned").elapsed()
            > self.settings.packet_timeout;
        let heartbeat_stale = self
            .last_heartbeat_ok_at
            .lock()
            .expect("mutex poisoned")
            .elapsed()
            > self.settings.heartbeat_freshness_timeout;

        if disconnected || error_heavy || packet_stale || heartbeat_stale {
            self.reconnect().await;
            return;
        }

        if matches!(self.config, RadioConfig::Tcp { .. }) {
            if let Some(err) = self.radio.socket_error().await {
                self.notify_connection_error(ConnectionError::SocketError(err.to_string()))
                    .await;
                return;
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), self.radio.get_my_node_info()).await {
            Ok(Ok(_)) => {
                *self.last_heartbeat_ok_at.lock().expect("mutex poisoned") = Instant::now();
            }
            _ => {
                self.error_count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_doubles_and_caps() {
        let settings = ConnectionManagerSettings::default();
        let manager_settings = settings.clone();
        let delay_of = |attempt: u32| -> Duration {
            let exponent = attempt.saturating_sub(1).min(16);
            manager_settings
                .base_delay
                .saturating_mul(1u32 << exponent)
                .min(manager_settings.max_delay)
        };
        assert_eq!(delay_of(1), Duration::from_secs(5));
        assert_eq!(delay_of(2), Duration::from_secs(10));
        assert_eq!(delay_of(3), Duration::from_secs(20));
        assert_eq!(delay_of(4), Duration::from_secs(40));
        assert_eq!(delay_of(5), Duration::from_secs(60)); // capped
    }
}
