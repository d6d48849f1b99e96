//! Process-wide cancellation context.
//!
//! Every long-running task in the bridge (health monitor, traceroute worker,
//! MQTT event loop, reverse-path timers) is handed a clone of [`Shutdown`]
//! instead of reaching for a module-level signal handler. All blocking waits
//! race against [`Shutdown::cancelled`] so a SIGINT/SIGTERM unblocks them
//! promptly instead of waiting out a sleep.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Cheaply cloneable shutdown context, passed explicitly to every task.
#[derive(Clone, Debug)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Signal shutdown to every holder of this context.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been signalled. Safe to `select!` against.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration`, or return early if shutdown fires first.
    ///
    /// Returns `true` if the full sleep elapsed, `false` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.token.cancelled() => false,
        }
    }

    /// Run `fut` to completion, or abandon it if shutdown fires first.
    ///
    /// Returns `None` if cancelled before `fut` resolved.
    pub async fn race<F, T>(&self, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            out = fut => Some(out),
            _ = self.token.cancelled() => None,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_cancel() {
        let shutdown = Shutdown::new();
        let completed = shutdown.sleep(Duration::from_millis(5)).await;
        assert!(completed);
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let shutdown = Shutdown::new();
        let other = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            other.cancel();
        });
        let completed = shutdown.sleep(Duration::from_secs(30)).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn race_returns_none_on_cancel() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let result = shutdown
            .race(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                42
            })
            .await;
        assert_eq!(result, None);
    }
}
