//! Bounded-identity work queue: at most one pending entry per key.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

/// A FIFO queue that silently drops an offered item if an item with the same
/// key is already queued. Safe for one consumer and many producers.
pub struct DeduplicatedQueue<T, K> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    key_fn: Box<dyn Fn(&T) -> K + Send + Sync>,
}

struct Inner<T> {
    items: VecDeque<T>,
    keys: HashSet<u64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, K> DeduplicatedQueue<T, K>
where
    T: Send + 'static,
    K: Eq + Hash + Send + 'static,
{
    pub fn new<F>(key_fn: F) -> Self
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                keys: HashSet::new(),
                _marker: std::marker::PhantomData,
            }),
            notify: Notify::new(),
            key_fn: Box::new(key_fn),
        }
    }

    /// Enqueue `item` unless its key is already present. Returns whether it
    /// was enqueued.
    pub fn offer(&self, item: T) -> bool
    where
        K: Hash,
    {
        let key = hash_key(&(self.key_fn)(&item));
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if !inner.keys.insert(key) {
            return false;
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Pop the front item, removing its key atomically with the pop. Waits
    /// up to `timeout`, waking on producer activity; returns `None` on
    /// timeout.
    pub async fn take(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        let item = inner.items.pop_front()?;
        let key = hash_key(&(self.key_fn)(&item));
        inner.keys.remove(&key);
        Some(item)
    }

    /// Approximate length.
    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").items.len()
    }
}

fn hash_key<K: Hash>(key: &K) -> u64 {
    use std::hash::Hasher;
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<T: Debug, K> Debug for DeduplicatedQueue<T, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeduplicatedQueue")
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queue() -> DeduplicatedQueue<(String, u32), String> {
        DeduplicatedQueue::new(|item: &(String, u32)| item.0.clone())
    }

    #[test]
    fn duplicate_key_is_dropped() {
        let q = queue();
        assert!(q.offer(("!abcd".into(), 0)));
        assert!(!q.offer(("!abcd".into(), 1)));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn distinct_keys_both_enqueue() {
        let q = queue();
        assert!(q.offer(("!abcd".into(), 0)));
        assert!(q.offer(("!efgh".into(), 0)));
        assert_eq!(q.size(), 2);
    }

    #[tokio::test]
    async fn take_removes_key_so_requeue_succeeds() {
        let q = queue();
        assert!(q.offer(("!abcd".into(), 0)));
        let (key, _) = q.take(Duration::from_secs(1)).await.unwrap();
        assert_eq!(key, "!abcd");
        assert_eq!(q.size(), 0);
        assert!(q.offer(("!abcd".into(), 1)));
    }

    #[tokio::test]
    async fn take_times_out_on_empty_queue() {
        let q = queue();
        let result = q.take(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn take_wakes_on_producer() {
        let q = Arc::new(queue());
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.offer(("!abcd".into(), 0));
        });
        let result = q.take(Duration::from_secs(2)).await;
        assert_eq!(result.unwrap().0, "!abcd");
    }
}
