//! Upward controller
//!
//! Queue-driven workers that back-propagate status and metadata from the
//! super cluster to tenant masters. Keys have the form
//! `cluster/namespace/name`, or `cluster/name` for cluster-scoped kinds.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::syncer::error::{BackoffConfig, Result, SyncerError};
use crate::syncer::queue::WorkQueue;
use crate::syncer::reconcile::UwReconciler;

#[derive(Clone, Debug)]
pub struct UwOptions {
    pub workers: usize,
    pub backoff: BackoffConfig,
}

impl Default for UwOptions {
    fn default() -> Self {
        Self {
            workers: crate::config::SUPER_CLUSTER_WORKER,
            backoff: BackoffConfig::default(),
        }
    }
}

pub struct UpwardController {
    kind: &'static str,
    queue: Arc<WorkQueue<String>>,
    workers: usize,
}

impl UpwardController {
    pub fn new(kind: &'static str, options: UwOptions) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queue: WorkQueue::new(options.backoff),
            workers: options.workers,
        })
    }

    pub fn add_to_queue(&self, key: String) {
        self.queue.add(key);
    }

    /// Run the worker pool until `stop` fires.
    pub async fn start(
        &self,
        reconciler: Arc<dyn UwReconciler>,
        stop: CancellationToken,
    ) -> Result<()> {
        {
            let queue = Arc::clone(&self.queue);
            let stop = stop.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                queue.shutdown();
            });
        }

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&reconciler);
            let kind = self.kind;
            workers.spawn(async move {
                while let Some(key) = queue.next().await {
                    match reconciler.back_populate(&key).await {
                        Ok(()) => queue.forget(&key),
                        Err(SyncerError::ClusterNotJoined(cluster)) => {
                            warn!(kind, cluster = %cluster, key = %key, "dropping upward key for unjoined cluster");
                            queue.forget(&key);
                        }
                        Err(err) if err.is_retryable() => {
                            warn!(kind, key = %key, error = %err, "back populate failed, backing off");
                            Arc::clone(&queue).add_rate_limited(key.clone());
                        }
                        Err(err) => {
                            error!(kind, key = %key, error = %err, "dropping upward key after non-retryable error");
                            queue.forget(&key);
                        }
                    }
                    queue.done(&key);
                }
            });
        }
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}
