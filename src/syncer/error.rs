//! Error types for the syncer controllers

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncerError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The delegation-UID invariant is broken for one object. Non-retryable:
    /// the patroller remediates the pair, looping here cannot help.
    #[error("{kind} {name} delegated UID is different from tenant object")]
    UidMismatch { kind: &'static str, name: String },

    /// Pod creation gate: neither the super `kubernetes` service nor the
    /// tenant DNS service is ready.
    #[error("service is not ready in cluster {0}")]
    ServiceNotReady(String),

    #[error("failed to get vSecret for service account {account} in {namespace}")]
    TenantTokenSecretMissing { account: String, namespace: String },

    #[error("failed to find sa secret from super master in {0}")]
    SuperTokenSecretMissing(String),

    /// The tenant cluster is not (or no longer) joined. Items keyed to an
    /// unjoined cluster are dropped after one pass.
    #[error("tenant cluster {0} is not joined")]
    ClusterNotJoined(String),

    #[error("object {namespace}/{name} not found in tenant cache")]
    NotFoundInCache { namespace: String, name: String },

    #[error("tenant cluster {0} has no client handle")]
    NoClusterClient(String),

    #[error("invalid work item key: {0}")]
    InvalidKey(String),

    #[error("failed to wait for caches to sync")]
    CacheSync,

    #[error("{0}")]
    Internal(String),
}

impl SyncerError {
    /// Whether the worker should re-queue the item with backoff. Broken
    /// invariants and malformed input never resolve by retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncerError::Kube(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            SyncerError::UidMismatch { .. } => false,
            SyncerError::Serialization(_) => false,
            SyncerError::InvalidKey(_) => false,
            SyncerError::ClusterNotJoined(_) => false,
            SyncerError::NoClusterClient(_) => false,
            SyncerError::ServiceNotReady(_) => true,
            SyncerError::TenantTokenSecretMissing { .. } => true,
            SyncerError::SuperTokenSecretMissing(_) => true,
            SyncerError::NotFoundInCache { .. } => true,
            SyncerError::CacheSync => false,
            SyncerError::Internal(_) => true,
        }
    }
}

pub type Result<T, E = SyncerError> = std::result::Result<T, E>;

/// True when a kube API error is a 404 for the request target. A delete
/// hitting 404 means the work is already done.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// True when a create hit an existing object. Ownership is verified
/// separately through the delegation UID, so this is success for DWS.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists")
}

/// Exponential backoff configuration shared by the MC and UW queues.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        let capped_delay = delay_with_jitter.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_mismatch_is_not_retryable() {
        let err = SyncerError::UidMismatch {
            kind: "pod",
            name: "pod-1".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("delegated UID is different"));
    }

    #[test]
    fn test_service_not_ready_is_retryable() {
        let err = SyncerError::ServiceNotReady("cluster-a".to_string());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("service is not ready"));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::default()
        };
        let first = backoff.delay_for_attempt(0);
        let second = backoff.delay_for_attempt(1);
        let huge = backoff.delay_for_attempt(30);
        assert!(second > first);
        assert_eq!(huge, backoff.max_delay);
    }
}
