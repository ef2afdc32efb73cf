//! Syncer configuration
//!
//! All recognized knobs live here with their documented defaults. The
//! configuration is read once at startup and shared immutably across every
//! controller loop.

use std::collections::BTreeSet;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::scheduler::ResourceList;

/// Client-side throttle overriding the client-go style 5 qps / 10 burst.
pub const DEFAULT_SCHEDULER_CLIENT_QPS: u32 = 100;
pub const DEFAULT_SCHEDULER_CLIENT_BURST: u32 = 500;

/// Absolute timeout of any single API request, including reading the
/// response body.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker pool sizes for the tenant-facing (DWS) and super-facing (UWS)
/// queues of each resource kind.
pub const VIRTUAL_CLUSTER_WORKER: usize = 3;
pub const SUPER_CLUSTER_WORKER: usize = 3;

/// Default interval between two patrol scans of one resource kind.
pub const DEFAULT_PATROL_PERIOD: Duration = Duration::from_secs(60);

/// Sentinel "unlimited" capacity assigned to the shadow cluster that holds
/// namespaces which have not been scheduled yet.
pub fn shadow_cluster_capacity() -> ResourceList {
    ResourceList::from([
        ("cpu".to_string(), Quantity(format!("{}", i32::MAX))),
        ("memory".to_string(), Quantity(format!("{}Gi", i32::MAX))),
    ])
}

/// How a resource kind takes part in synchronization.
///
/// Changing a kind's mode resets its syncer: the webhook and the reconcilers
/// for that kind go quiescent unless the mode is `Propagate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropagationMode {
    /// Full bidirectional sync.
    Propagate,
    /// The kind is known but deliberately not synced.
    Ignore,
}

/// One synchronized resource kind, as configured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub group: String,
    pub resource: String,
    pub mode: Option<PropagationMode>,
}

impl ResourceSpec {
    pub fn propagated(group: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            mode: Some(PropagationMode::Propagate),
        }
    }
}

/// Top-level syncer configuration.
#[derive(Clone, Debug)]
pub struct SyncerConfiguration {
    /// Client throttle.
    pub client_qps: u32,
    pub client_burst: u32,
    /// Per-call absolute timeout.
    pub request_timeout: Duration,
    /// DWS worker count per kind.
    pub virtual_cluster_worker: usize,
    /// UWS worker count per kind.
    pub super_cluster_worker: usize,
    /// Patrol interval per kind.
    pub patrol_period: Duration,
    /// The set of resource kinds under management.
    pub resources: Vec<ResourceSpec>,
    /// Namespaces the hierarchy adjunct never touches.
    pub excluded_namespaces: BTreeSet<String>,
}

impl Default for SyncerConfiguration {
    fn default() -> Self {
        Self {
            client_qps: DEFAULT_SCHEDULER_CLIENT_QPS,
            client_burst: DEFAULT_SCHEDULER_CLIENT_BURST,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            virtual_cluster_worker: VIRTUAL_CLUSTER_WORKER,
            super_cluster_worker: SUPER_CLUSTER_WORKER,
            patrol_period: DEFAULT_PATROL_PERIOD,
            resources: vec![
                ResourceSpec::propagated("", "pods"),
                ResourceSpec::propagated("", "services"),
                ResourceSpec::propagated("", "secrets"),
                ResourceSpec::propagated("", "configmaps"),
                ResourceSpec::propagated("", "namespaces"),
                ResourceSpec::propagated("storage.k8s.io", "storageclasses"),
                ResourceSpec::propagated("scheduling.k8s.io", "priorityclasses"),
            ],
            excluded_namespaces: BTreeSet::from([
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
                "hnc-system".to_string(),
            ]),
        }
    }
}

impl SyncerConfiguration {
    /// The configured mode for a `(group, resource)` pair, if any.
    pub fn mode_for(&self, group: &str, resource: &str) -> Option<PropagationMode> {
        self.resources
            .iter()
            .find(|r| r.group == group && r.resource == resource)
            .and_then(|r| r.mode)
    }

    /// Whether a kind is fully synchronized.
    pub fn is_propagated(&self, group: &str, resource: &str) -> bool {
        self.mode_for(group, resource) == Some(PropagationMode::Propagate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncerConfiguration::default();
        assert_eq!(config.client_qps, 100);
        assert_eq!(config.client_burst, 500);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.virtual_cluster_worker, 3);
        assert_eq!(config.super_cluster_worker, 3);
    }

    #[test]
    fn test_mode_lookup() {
        let config = SyncerConfiguration::default();
        assert!(config.is_propagated("", "pods"));
        assert!(config.is_propagated("storage.k8s.io", "storageclasses"));
        assert_eq!(config.mode_for("apps", "deployments"), None);
    }

    #[test]
    fn test_shadow_capacity_is_unlimited_sentinel() {
        let capacity = shadow_cluster_capacity();
        assert_eq!(capacity.get("cpu").unwrap().0, format!("{}", i32::MAX));
        assert_eq!(capacity.get("memory").unwrap().0, format!("{}Gi", i32::MAX));
    }
}
