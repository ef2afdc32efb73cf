//! Reconciliation contract shared by all controllers

use std::time::Duration;

use async_trait::async_trait;

use crate::syncer::error::Result;
use crate::syncer::queue::WorkItem;

/// One unit of downward-sync work: a tenant object observed at
/// `(cluster, namespace, name)` with the UID the informer delivered.
/// Cluster-scoped kinds leave the namespace empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub cluster_name: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Request {
    pub fn new(cluster_name: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }
}

impl WorkItem for Request {
    type Key = (String, String, String);

    fn work_key(&self) -> Self::Key {
        (
            self.cluster_name.clone(),
            self.namespace.clone(),
            self.name.clone(),
        )
    }
}

/// Outcome of one reconcile pass. Errors take the backoff path instead.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// Downward reconciler: projects one tenant object onto the super cluster.
#[async_trait]
pub trait DwReconciler: Send + Sync {
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult>;
}

/// Upward reconciler: back-populates observable state for one key of the
/// form `cluster/namespace/name` (or `cluster/name` for cluster-scoped
/// kinds).
#[async_trait]
pub trait UwReconciler: Send + Sync {
    async fn back_populate(&self, key: &str) -> Result<()>;
}

/// Periodic full-scan reconciler.
#[async_trait]
pub trait PatrolReconciler: Send + Sync {
    async fn patroller_do(&self);
}

/// Split an upward key into `(cluster, namespace, name)`. Two-part keys
/// belong to cluster-scoped kinds.
pub fn split_uw_key(key: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [cluster, namespace, name] => {
            Some((cluster.to_string(), namespace.to_string(), name.to_string()))
        }
        [cluster, name] => Some((cluster.to_string(), String::new(), name.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_ignores_uid() {
        let a = Request::new("c", "ns", "x", "uid-1");
        let b = Request::new("c", "ns", "x", "uid-2");
        assert_eq!(a.work_key(), b.work_key());
    }

    #[test]
    fn test_split_uw_key_forms() {
        assert_eq!(
            split_uw_key("c/ns/x"),
            Some(("c".to_string(), "ns".to_string(), "x".to_string()))
        );
        assert_eq!(
            split_uw_key("c/x"),
            Some(("c".to_string(), String::new(), "x".to_string()))
        );
        assert_eq!(split_uw_key("x"), None);
    }
}
