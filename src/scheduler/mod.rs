//! Multi-cluster resource scheduler cache
//!
//! Tenant namespaces are divided into fixed-size resource slices and packed
//! onto super clusters subject to per-cluster capacity. The cache is the
//! single source of truth for placements; every structural read and write
//! goes through one lock, and no API calls happen under it.

pub mod cluster;
pub mod namespace;
pub mod quantity;

pub use cluster::{Cluster, SchedulerPod};
pub use namespace::{least_fit_slice_num, Namespace, Placement, Slice};
pub use quantity::ResourceList;

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::scheduler::quantity::InvalidQuantity;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidQuantity(#[from] InvalidQuantity),

    #[error("slice resource {resource} does not exist in capacity of cluster {cluster}")]
    UnknownResource { resource: String, cluster: String },

    #[error("allocating slice would exceed {resource} capacity of cluster {cluster}")]
    CapacityExceeded { resource: String, cluster: String },

    #[error("slice belongs to cluster {slice_cluster}, not {cluster}")]
    WrongCluster {
        slice_cluster: String,
        cluster: String,
    },

    #[error("namespace {0} already has slices allocated")]
    DuplicateNamespace(String),

    #[error("namespace {0} has no slices allocated")]
    NamespaceNotFound(String),

    #[error("removing namespace would drive {resource} allocation of cluster {cluster} negative")]
    NegativeAlloc { resource: String, cluster: String },

    #[error("quota slice resource {0} is missing from quota")]
    MissingQuotaResource(String),

    #[error("quota slice resource {0} has value of 0")]
    ZeroSliceResource(String),

    #[error("quota slice is larger than quota for resource {0}")]
    SliceLargerThanQuota(String),

    #[error("quota resource {0} is missing from quota slice")]
    MissingSliceResource(String),

    #[error("cluster {0} is not in the cache")]
    ClusterNotFound(String),

    #[error("placements cover {placed} slices, namespace needs {required}")]
    PlacementMismatch { placed: usize, required: usize },
}

struct CacheState {
    clusters: BTreeMap<String, Cluster>,
    namespaces: BTreeMap<String, Namespace>,
}

/// The scheduler cache: clusters, namespace placements and pods, behind a
/// single lock.
pub struct SchedulerCache {
    state: Mutex<CacheState>,
}

impl Default for SchedulerCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                clusters: BTreeMap::new(),
                namespaces: BTreeMap::new(),
            }),
        }
    }

    pub fn add_cluster(&self, cluster: Cluster) {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        state.clusters.insert(cluster.name().to_string(), cluster);
    }

    pub fn remove_cluster(&self, name: &str) {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        state.clusters.remove(name);
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("scheduler cache lock poisoned")
            .clusters
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot of one cluster, for plan simulation.
    pub fn snapshot_cluster(&self, name: &str) -> Option<Cluster> {
        self.state
            .lock()
            .expect("scheduler cache lock poisoned")
            .clusters
            .get(name)
            .map(Cluster::deep_copy)
    }

    pub fn namespace(&self, key: &str) -> Option<Namespace> {
        self.state
            .lock()
            .expect("scheduler cache lock poisoned")
            .namespaces
            .get(key)
            .cloned()
    }

    /// Place a namespace according to its schedule, atomically across every
    /// target cluster. Partial placements are rolled back on failure.
    pub fn add_namespace(&self, namespace: Namespace) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        Self::place(&mut state, namespace)
    }

    /// Remove a namespace's slices from every cluster holding them.
    pub fn remove_namespace(&self, key: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        Self::unplace(&mut state, key).map(|_| ())
    }

    /// Re-schedule a namespace onto a new placement map: remove, then add,
    /// in one critical section. If the new placement cannot be applied, the
    /// old one is restored.
    pub fn apply_placement(
        &self,
        key: &str,
        placements: BTreeMap<String, usize>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        let old = Self::unplace(&mut state, key)?;

        let mut updated = old.clone();
        updated.set_new_placements(placements);
        if let Err(err) = Self::place(&mut state, updated) {
            // The old slices were just released under this same lock, so
            // restoring them cannot run out of capacity.
            Self::place(&mut state, old).expect("restoring previous placement cannot fail");
            return Err(err);
        }
        Ok(())
    }

    fn place(state: &mut CacheState, namespace: Namespace) -> Result<(), SchedulerError> {
        let key = namespace.key();
        if state.namespaces.contains_key(&key) {
            return Err(SchedulerError::DuplicateNamespace(key));
        }

        let required = namespace.total_slices()?;
        let placed: usize = namespace.schedule().iter().map(Placement::num).sum();
        if placed != required {
            return Err(SchedulerError::PlacementMismatch { placed, required });
        }
        for placement in namespace.schedule() {
            if !state.clusters.contains_key(placement.cluster()) {
                return Err(SchedulerError::ClusterNotFound(
                    placement.cluster().to_string(),
                ));
            }
        }

        let mut applied: Vec<String> = Vec::new();
        for placement in namespace.schedule() {
            let slices = (0..placement.num())
                .map(|_| Slice::new(&key, namespace.quota_slice().clone(), placement.cluster()))
                .collect();
            let cluster = state
                .clusters
                .get_mut(placement.cluster())
                .expect("cluster existence checked above");
            if let Err(err) = cluster.add_namespace(&key, slices) {
                for name in applied {
                    let rollback = state
                        .clusters
                        .get_mut(&name)
                        .expect("rollback cluster must exist");
                    let _ = rollback.remove_namespace(&key);
                }
                return Err(err);
            }
            applied.push(placement.cluster().to_string());
        }

        state.namespaces.insert(key, namespace);
        Ok(())
    }

    fn unplace(state: &mut CacheState, key: &str) -> Result<Namespace, SchedulerError> {
        let namespace = state
            .namespaces
            .get(key)
            .ok_or_else(|| SchedulerError::NamespaceNotFound(key.to_string()))?;
        let targets: Vec<String> = namespace
            .schedule()
            .iter()
            .map(|p| p.cluster().to_string())
            .collect();
        for name in &targets {
            let cluster = state
                .clusters
                .get_mut(name)
                .ok_or_else(|| SchedulerError::ClusterNotFound(name.clone()))?;
            cluster.remove_namespace(key)?;
        }
        Ok(state
            .namespaces
            .remove(key)
            .expect("namespace presence checked above"))
    }

    pub fn add_pod(&self, pod: SchedulerPod) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        let cluster = state
            .clusters
            .get_mut(pod.cluster())
            .ok_or_else(|| SchedulerError::ClusterNotFound(pod.cluster().to_string()))?;
        cluster.add_pod(pod);
        Ok(())
    }

    pub fn remove_pod(&self, pod: &SchedulerPod) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().expect("scheduler cache lock poisoned");
        let cluster = state
            .clusters
            .get_mut(pod.cluster())
            .ok_or_else(|| SchedulerError::ClusterNotFound(pod.cluster().to_string()))?;
        cluster.remove_pod(pod);
        Ok(())
    }
}
