//! Single-worker, globally rate-limited traceroute scheduler.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::connection::{ConnectionError, ConnectionManager};
use crate::queue::DeduplicatedQueue;
use crate::radio::RadioError;
use crate::shutdown::Shutdown;

use super::persistence::{TraceroutePersistence, TracerouteStateDoc};

#[derive(Debug, Clone)]
pub struct TracerouteManagerSettings {
    pub interval: Duration,
    pub cooldown: Duration,
    pub max_retries: u32,
    pub max_backoff: Duration,
    pub send_timeout: Duration,
    pub shutdown_send_timeout: Duration,
    /// The global cooldown makes anything above 1 effectively serial;
    /// kept configurable but the worker here is always single-threaded
    /// regardless of this value.
    pub max_concurrent_sends: u32,
}

impl Default for TracerouteManagerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12 * 60 * 60),
            cooldown: Duration::from_secs(3 * 60),
            max_retries: 3,
            max_backoff: Duration::from_secs(24 * 60 * 60),
            send_timeout: Duration::from_secs(30),
            shutdown_send_timeout: Duration::from_secs(2),
            max_concurrent_sends: 2,
        }
    }
}

pub struct TracerouteManager {
    queue: DeduplicatedQueue<(String, u32), String>,
    connection: Arc<ConnectionManager>,
    persistence: TraceroutePersistence,
    state: AsyncMutex<TracerouteStateDoc>,
    last_global_send_at: StdMutex<Option<Instant>>,
    settings: TracerouteManagerSettings,
    shutdown: Shutdown,
    worker_task: StdMutex<Option<JoinHandle<()>>>,
}

impl TracerouteManager {
    pub async fn spawn(
        connection: Arc<ConnectionManager>,
        persistence: TraceroutePersistence,
        settings: TracerouteManagerSettings,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let initial_state = persistence.load(now_unix()).await;

        let manager = Arc::new(Self {
            queue: DeduplicatedQueue::new(|job: &(String, u32)| job.0.clone()),
            connection,
            persistence,
            state: AsyncMutex::new(initial_state),
            last_global_send_at: StdMutex::new(None),
            settings,
            shutdown: shutdown.clone(),
            worker_task: StdMutex::new(None),
        });

        let worker_task = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run_worker(shutdown).await })
        };
        *manager.worker_task.lock().expect("mutex poisoned") = Some(worker_task);

        manager
    }

    pub fn queue_len(&self) -> usize {
        self.queue.size()
    }

    /// If `is_new` and the node isn't in backoff, offer a traceroute job.
    /// Independently, if the node's last send is older than the refresh
    /// interval and it isn't in backoff, offer a refresh job. The queue's
    /// dedup collapses a double-offer into one.
    pub async fn process_packet_for_traceroutes(&self, node_id: &str, is_new: bool) {
        let now = now_unix();
        if self.is_in_backoff(node_id, now).await {
            return;
        }
        let stale = {
            let state = self.state.lock().await;
            match state.last_sent_at.get(node_id) {
                Some(last) => now - last > self.settings.interval.as_secs() as i64,
                None => true,
            }
        };
        if is_new || stale {
            self.queue.offer((node_id.to_string(), 0));
        }
    }

    /// Manual trigger, same backoff rules as the automatic path.
    pub async fn queue_traceroute(&self, node_id: &str) {
        let now = now_unix();
        if !self.is_in_backoff(node_id, now).await {
            self.queue.offer((node_id.to_string(), 0));
        }
    }

    pub async fn record_success(&self, node_id: &str) {
        let now = now_unix();
        let doc = {
            let mut state = self.state.lock().await;
            state.last_sent_at.insert(node_id.to_string(), now);
            state.consecutive_failures.remove(node_id);
            state.backoff_until.remove(node_id);
            state.saved_at = now;
            state.clone()
        };
        if let Err(e) = self.persistence.save(&doc).await {
            warn!(error = %e, node_id, "failed to persist traceroute state after success");
        }
    }

    async fn record_failure(&self, node_id: &str) -> u32 {
        let now = now_unix();
        let (count, doc) = {
            let mut state = self.state.lock().await;
            let count = state
                .consecutive_failures
                .entry(node_id.to_string())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let count = *count;
            let backoff = backoff_seconds(
                count,
                self.settings.interval.as_secs(),
                self.settings.max_backoff.as_secs(),
            );
            if backoff > 0 {
                state.backoff_until.insert(node_id.to_string(), now + backoff as i64);
            } else {
                state.backoff_until.remove(node_id);
            }
            state.saved_at = now;
            (count, state.clone())
        };
        if let Err(e) = self.persistence.save(&doc).await {
            warn!(error = %e, node_id, "failed to persist traceroute state after failure");
        }
        count
    }

    async fn is_in_backoff(&self, node_id: &str, now: i64) -> bool {
        self.state
            .lock()
            .await
            .backoff_until
            .get(node_id)
            .is_some_and(|until| now < *until)
    }

    fn cooldown_remaining(&self) -> Duration {
        match *self.last_global_send_at.lock().expect("mutex poisoned") {
            None => Duration::ZERO,
            Some(last) => {
                let elapsed = last.elapsed();
                self.settings.cooldown.saturating_sub(elapsed)
            }
        }
    }

    async fn handle_failure(&self, node_id: &str, retries: u32) {
        let failures = self.record_failure(node_id).await;
        if failures < self.settings.max_retries && !self.shutdown.is_cancelled() {
            self.queue.offer((node_id.to_string(), retries + 1));
        }
    }

    async fn run_worker(self: Arc<Self>, shutdown: Shutdown) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let Some((node_id, retries)) = self.queue.take(Duration::from_secs(1)).await else {
                continue;
            };

            let now = now_unix();
            if self.is_in_backoff(&node_id, now).await {
                self.queue.offer((node_id.clone(), retries));
                if !shutdown.sleep(Duration::from_secs(5)).await {
                    return;
                }
                continue;
            }

            loop {
                let remaining = self.cooldown_remaining();
                if remaining.is_zero() {
                    break;
                }
                let nap = remaining.min(Duration::from_secs(1));
                if !shutdown.sleep(nap).await {
                    return;
                }
            }

            let Some(radio) = self.connection.get_ready_interface().await else {
                self.queue.offer((node_id.clone(), retries));
                continue;
            };

            *self.last_global_send_at.lock().expect("mutex poisoned") = Some(Instant::now());

            let send_timeout = if shutdown.is_cancelled() {
                self.settings.shutdown_send_timeout
            } else {
                self.settings.send_timeout
            };

            match tokio::time::timeout(send_timeout, radio.send_traceroute(&node_id)).await {
                Ok(Ok(())) => {
                    self.record_success(&node_id).await;
                }
                Ok(Err(RadioError::NotConnected)) | Ok(Err(RadioError::Io(_))) => {
                    self.connection
                        .notify_connection_error(ConnectionError::Other(
                            "traceroute send observed a broken connection".into(),
                        ))
                        .await;
                    self.queue.offer((node_id.clone(), retries));
                }
                Ok(Err(_)) | Err(_) => {
                    self.handle_failure(&node_id, retries).await;
                }
            }
        }
    }

    /// Signal shutdown, stop the worker within a bounded time even if a
    /// send is stuck, then persist final state.
    pub async fn cleanup(&self) {
        self.shutdown.cancel();
        let task = self.worker_task.lock().expect("mutex poisoned").take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(Duration::from_secs(3), task).await;
        }
        let doc = self.state.lock().await.clone();
        if let Err(e) = self.persistence.save(&doc).await {
            warn!(error = %e, "failed to persist traceroute state during cleanup");
        }
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `backoff(f) = 0` for `f < 2`; else `min(interval * 2^(f-2), maxBackoff)`.
fn backoff_seconds(failures: u32, interval_secs: u64, max_backoff_secs: u64) -> u64 {
    if failures < 2 {
        return 0;
    }
    let exponent = (failures - 2).min(32);
    let scaled = interval_secs.saturating_mul(1u64 << exponent);
    scaled.min(max_backoff_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_zero_below_two_failures() {
        assert_eq!(backoff_seconds(0, 100, 10_000), 0);
        assert_eq!(backoff_seconds(1, 100, 10_000), 0);
    }

    #[test]
    fn backoff_doubles_from_second_failure() {
        assert_eq!(backoff_seconds(2, 100, 10_000), 100);
        assert_eq!(backoff_seconds(3, 100, 10_000), 200);
        assert_eq!(backoff_seconds(4, 100, 10_000), 400);
    }

    #[test]
    fn backoff_caps_at_max() {
        assert_eq!(backoff_seconds(10, 100, 1_000), 1_000);
    }
}
