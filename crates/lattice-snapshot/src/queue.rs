//! De-duplicating, rate-limited work queue of object keys
//!
//! Semantics follow the client-go workqueue the controller pattern is built
//! around:
//!
//! * a key added while already pending collapses into the pending entry
//! * a key added while a worker holds it is parked and re-queued on `done`,
//!   so no two workers ever process the same key at once
//! * `add_rate_limited` re-adds after a per-key exponential delay which
//!   `forget` resets

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// First retry delay of the per-key backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Ceiling of the per-key backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Debug)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemBackoff {
    /// Create a limiter with the given bounds
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        // 2^31 * 5ms already exceeds any sane cap
        let factor = 2u32.saturating_pow(exp.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Clear the failure history for `key`
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: ItemBackoff,
}

/// Work queue handle; clones share the same queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    /// Create a queue with the default backoff bounds
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, ItemBackoff::default())
    }

    /// Create a queue with a custom backoff
    pub fn with_backoff(name: &'static str, backoff: ItemBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue name used in logs
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Mark `key` as needing processing
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // re-queued by done()
            return;
        }
        trace!(queue = self.inner.name, key = %key, "enqueued");
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down and drained
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; re-queues it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Re-add `key` after its backoff delay
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.backoff.when(key);
        trace!(
            queue = self.inner.name,
            key = %key,
            delay_ms = delay.as_millis() as u64,
            "requeue with backoff"
        );
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.inner.backoff.forget(key);
    }

    /// Failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.backoff.num_requeues(key)
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    /// Whether `shutdown` was called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_keys_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("default/a");
        queue.add("default/a");
        queue.add("default/b");
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
        assert_eq!(queue.get().await.as_deref(), Some("default/b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let key = queue.get().await.expect("key");

        // a second event while a worker owns the key
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let queue = WorkQueue::new("test");
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(worker.await.expect("join"), None);

        queue.add("ignored");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let queue = WorkQueue::with_backoff(
            "test",
            ItemBackoff::new(Duration::from_millis(100), Duration::from_secs(1)),
        );
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues("a"), 1);
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);

        queue.forget("a");
        assert_eq!(queue.num_requeues("a"), 0);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(backoff.when("k"), Duration::from_millis(5));
        assert_eq!(backoff.when("k"), Duration::from_millis(10));
        assert_eq!(backoff.when("k"), Duration::from_millis(20));
        assert_eq!(backoff.when("k"), Duration::from_millis(30));
        assert_eq!(backoff.when("other"), Duration::from_millis(5));

        backoff.forget("k");
        assert_eq!(backoff.when("k"), Duration::from_millis(5));
    }
}
