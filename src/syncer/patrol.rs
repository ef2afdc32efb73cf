//! Patroller
//!
//! Periodic full-scan reconciliation for one resource kind. The patroller
//! only schedules scans; the per-kind `patroller_do` walks both sides and
//! re-enqueues anything that violates the pairing invariants. Scans survive
//! partial tenant-cluster unavailability: a missing tenant cache skips that
//! cluster only.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::syncer::error::Result;
use crate::syncer::reconcile::PatrolReconciler;

#[derive(Clone, Debug)]
pub struct PatrolOptions {
    pub period: Duration,
}

impl Default for PatrolOptions {
    fn default() -> Self {
        Self {
            period: crate::config::DEFAULT_PATROL_PERIOD,
        }
    }
}

pub struct Patroller {
    kind: &'static str,
    period: Duration,
}

impl Patroller {
    pub fn new(kind: &'static str, options: PatrolOptions) -> Arc<Self> {
        Arc::new(Self {
            kind,
            period: options.period,
        })
    }

    /// Scan immediately, then on every period tick, until `stop` fires.
    pub async fn start(
        &self,
        reconciler: Arc<dyn PatrolReconciler>,
        stop: CancellationToken,
    ) -> Result<()> {
        loop {
            debug!(kind = self.kind, "patrol scan");
            reconciler.patroller_do().await;
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        scans: AtomicUsize,
        stop: CancellationToken,
    }

    #[async_trait]
    impl PatrolReconciler for Counter {
        async fn patroller_do(&self) {
            if self.scans.fetch_add(1, Ordering::SeqCst) >= 2 {
                self.stop.cancel();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_patroller_scans_periodically() {
        let patroller = Patroller::new(
            "service",
            PatrolOptions {
                period: Duration::from_secs(60),
            },
        );
        let stop = CancellationToken::new();
        let counter = Arc::new(Counter {
            scans: AtomicUsize::new(0),
            stop: stop.clone(),
        });
        patroller.start(counter.clone(), stop).await.unwrap();
        assert!(counter.scans.load(Ordering::SeqCst) >= 3);
    }
}
