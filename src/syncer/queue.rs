//! Keyed work queue
//!
//! Mirrors the semantics controller work queues rely on: adding an item that
//! is already pending is a no-op, an item whose key is currently being
//! processed is deferred until the worker calls [`WorkQueue::done`], and two
//! workers never hold the same key simultaneously. Retries go through
//! [`WorkQueue::add_rate_limited`], which applies per-key exponential
//! backoff until [`WorkQueue::forget`] resets it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::syncer::error::BackoffConfig;

/// An item that can be queued. The key identifies the logical work unit;
/// when the same key is enqueued twice, the newer item wins.
pub trait WorkItem: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn work_key(&self) -> Self::Key;
}

impl WorkItem for String {
    type Key = String;

    fn work_key(&self) -> String {
        self.clone()
    }
}

struct QueueState<T: WorkItem> {
    order: VecDeque<T::Key>,
    pending: HashMap<T::Key, T>,
    processing: HashSet<T::Key>,
    attempts: HashMap<T::Key, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T: WorkItem> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl<T: WorkItem> WorkQueue<T> {
    pub fn new(backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                pending: HashMap::new(),
                processing: HashSet::new(),
                attempts: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        })
    }

    pub fn add(&self, item: T) {
        let key = item.work_key();
        let mut state = self.state.lock().expect("work queue lock poisoned");
        if state.shutting_down {
            return;
        }
        let already_pending = state.pending.insert(key.clone(), item).is_some();
        if already_pending || state.processing.contains(&key) {
            // Either queued already, or done() will re-queue it.
            return;
        }
        state.order.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    pub fn add_after(self: Arc<Self>, item: T, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(item);
        });
    }

    /// Re-queue with exponential per-key backoff.
    pub fn add_rate_limited(self: Arc<Self>, item: T) {
        let key = item.work_key();
        let attempt = {
            let mut state = self.state.lock().expect("work queue lock poisoned");
            let attempt = state.attempts.entry(key).or_insert(0);
            let current = *attempt;
            *attempt += 1;
            current
        };
        let delay = self.backoff.delay_for_attempt(attempt);
        self.add_after(item, delay);
    }

    /// Reset the backoff state for a key after a successful pass.
    pub fn forget(&self, key: &T::Key) {
        self.state
            .lock()
            .expect("work queue lock poisoned")
            .attempts
            .remove(key);
    }

    /// Next item to process, or `None` once the queue is shut down and
    /// drained. The returned item's key is held until [`WorkQueue::done`].
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("work queue lock poisoned");
                while let Some(key) = state.order.pop_front() {
                    if let Some(item) = state.pending.remove(&key) {
                        state.processing.insert(key);
                        return Some(item);
                    }
                    // Stale key whose item was dropped (e.g. cluster
                    // unjoined); skip it.
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a key after processing. If the key was re-added meanwhile,
    /// it goes back on the queue.
    pub fn done(&self, key: &T::Key) {
        let mut state = self.state.lock().expect("work queue lock poisoned");
        state.processing.remove(key);
        if state.pending.contains_key(key) {
            state.order.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Drop all pending items that do not satisfy `keep`. In-flight items
    /// are unaffected; their keys are released normally via `done`.
    pub fn retain(&self, keep: impl Fn(&T) -> bool) {
        let mut state = self.state.lock().expect("work queue lock poisoned");
        state.pending.retain(|_, item| keep(item));
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("work queue lock poisoned");
        state.shutting_down = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("work queue lock poisoned")
            .pending
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_queue() -> Arc<WorkQueue<String>> {
        WorkQueue::new(BackoffConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: 0.0,
        })
    }

    #[tokio::test]
    async fn test_duplicate_add_collapses() {
        let queue = test_queue();
        queue.add("a".to_string());
        queue.add("a".to_string());
        queue.add("b".to_string());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await.as_deref(), Some("a"));
        assert_eq!(queue.next().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_key_in_flight_is_requeued_on_done() {
        let queue = test_queue();
        queue.add("a".to_string());
        let item = queue.next().await.unwrap();
        // Re-added while processing: must not be handed out again yet.
        queue.add("a".to_string());
        assert!(queue.len() == 1);
        queue.done(&item);
        assert_eq!(queue.next().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = test_queue();
        queue.add("a".to_string());
        queue.shutdown();
        assert_eq!(queue.next().await.as_deref(), Some("a"));
        assert_eq!(queue.next().await, None);
        queue.add("b".to_string());
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_retain_drops_pending() {
        let queue = test_queue();
        queue.add("cluster-a/x".to_string());
        queue.add("cluster-b/y".to_string());
        queue.retain(|item| !item.starts_with("cluster-a/"));
        assert_eq!(queue.next().await.as_deref(), Some("cluster-b/y"));
    }

    #[tokio::test]
    async fn test_rate_limited_redelivers() {
        let queue = test_queue();
        queue.clone().add_rate_limited("a".to_string());
        let item = tokio::time::timeout(Duration::from_secs(1), queue.next())
            .await
            .expect("item should be redelivered")
            .unwrap();
        assert_eq!(item, "a");
        queue.forget(&item);
    }
}
