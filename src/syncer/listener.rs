//! Cluster-change listener bus
//!
//! Broadcasts tenant-cluster join/leave events to every registered MC
//! controller. Registration happens while the manager is being assembled;
//! after `start` the listener set is never mutated, so broadcasts only take
//! a read lock.

use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::cluster::{ClusterState, TenantCluster};
use crate::syncer::mc::MultiClusterController;

/// Receives tenant-cluster membership changes.
pub trait ClusterChangeListener: Send + Sync {
    fn cluster_online(&self, cluster: &Arc<TenantCluster>);
    fn cluster_offline(&self, cluster: &Arc<TenantCluster>);
}

#[derive(Default)]
pub struct ClusterChangeBus {
    listeners: RwLock<Vec<Arc<dyn ClusterChangeListener>>>,
}

impl ClusterChangeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, listener: Arc<dyn ClusterChangeListener>) {
        self.listeners
            .write()
            .expect("listener bus lock poisoned")
            .push(listener);
    }

    /// Join a tenant cluster: every registered controller starts watching
    /// it. Called when the cluster transitions to `Running`.
    pub fn cluster_online(&self, cluster: &Arc<TenantCluster>) {
        cluster.set_state(ClusterState::Running);
        info!(cluster = %cluster.cluster_key(), "tenant cluster online");
        for listener in self
            .listeners
            .read()
            .expect("listener bus lock poisoned")
            .iter()
        {
            listener.cluster_online(cluster);
        }
    }

    /// Unjoin a tenant cluster: watches stop and pending work keyed to it
    /// is dropped. Called on `Deleted`.
    pub fn cluster_offline(&self, cluster: &Arc<TenantCluster>) {
        cluster.set_state(ClusterState::Deleted);
        info!(cluster = %cluster.cluster_key(), "tenant cluster offline");
        for listener in self
            .listeners
            .read()
            .expect("listener bus lock poisoned")
            .iter()
        {
            listener.cluster_offline(cluster);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .expect("listener bus lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Adapter forwarding bus events into one MC controller.
pub struct McListener<K>(pub Arc<MultiClusterController<K>>);

impl<K> ClusterChangeListener for McListener<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn cluster_online(&self, cluster: &Arc<TenantCluster>) {
        self.0.watch(Arc::clone(cluster));
    }

    fn cluster_offline(&self, cluster: &Arc<TenantCluster>) {
        self.0.unwatch(cluster.cluster_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::mc::McOptions;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[tokio::test]
    async fn test_bus_fans_out_to_controllers() {
        let bus = ClusterChangeBus::new();
        let mc = MultiClusterController::<ConfigMap>::new("configmap", McOptions::default());
        bus.register(Arc::new(McListener(Arc::clone(&mc))));

        let cluster = TenantCluster::detached("test", "tenant-1", "uid-1");
        bus.cluster_online(&cluster);
        assert_eq!(cluster.state(), ClusterState::Running);
        assert_eq!(mc.get_cluster_names(), vec![cluster.cluster_key().to_string()]);

        bus.cluster_offline(&cluster);
        assert_eq!(cluster.state(), ClusterState::Deleted);
        assert!(mc.get_cluster_names().is_empty());
    }
}
