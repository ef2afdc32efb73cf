//! Syncer controller framework
//!
//! The manager owns the set of per-kind resource syncers and runs their
//! three loops (DWS, UWS, Patrol) concurrently. A single cancellation token
//! is the cooperative stop channel for everything the manager spawns;
//! `start` blocks until it fires or any loop fails.

pub mod error;
pub mod executor;
pub mod listener;
pub mod mc;
pub mod patrol;
pub mod queue;
pub mod reconcile;
pub mod uw;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::Store;
use crate::config::SyncerConfiguration;
use crate::health::SyncerMetrics;
use crate::syncer::error::{Result, SyncerError};
use crate::syncer::listener::{ClusterChangeBus, ClusterChangeListener};
use crate::syncer::mc::McOptions;
use crate::syncer::patrol::PatrolOptions;
use crate::syncer::uw::UwOptions;

/// One per-kind syncer as the manager sees it: the three lifecycle loops
/// plus the listener that joins it to the cluster-change bus.
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    fn name(&self) -> &'static str;

    /// The listener the manager registers on the bus when this syncer is
    /// added.
    fn listener(&self) -> Arc<dyn ClusterChangeListener>;

    async fn start_dws(self: Arc<Self>, stop: CancellationToken) -> Result<()>;

    /// Kinds without upward state keep the default no-op.
    async fn start_uws(self: Arc<Self>, _stop: CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn start_patrol(self: Arc<Self>, stop: CancellationToken) -> Result<()>;
}

/// Per-syncer loop options, defaulted from the configuration.
#[derive(Clone, Debug, Default)]
pub struct ResourceSyncerOptions {
    pub mc: McOptions,
    pub uw: UwOptions,
    pub patrol: PatrolOptions,
}

/// Caches of super-cluster objects shared by the syncers. Reflectors feed
/// them; in tests they are filled directly.
#[derive(Default)]
pub struct SuperStores {
    pub pods: Store<Pod>,
    pub services: Store<Service>,
    pub secrets: Store<Secret>,
    pub configmaps: Store<ConfigMap>,
    pub namespaces: Store<Namespace>,
    pub storage_classes: Store<StorageClass>,
    pub priority_classes: Store<PriorityClass>,
}

impl SuperStores {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Everything a syncer registration needs to construct its controller.
pub struct InitContext {
    pub config: Arc<SyncerConfiguration>,
    pub super_client: Option<Client>,
    pub stores: Arc<SuperStores>,
    pub metrics: Arc<SyncerMetrics>,
    pub options: ResourceSyncerOptions,
    /// Stop channel handed to the reflectors a registration spawns.
    pub stop: CancellationToken,
}

/// Declarative registration of one syncer kind.
pub struct Registration {
    pub id: &'static str,
    pub disable: bool,
    pub init: fn(&InitContext) -> Result<Arc<dyn ResourceSyncer>>,
}

/// Invoked by a super-store reflector on every apply/delete event, before
/// the store is updated. Lets cluster-scoped syncers fan out upward keys.
pub type SuperEventHandler<K> = Arc<dyn Fn(&K) + Send + Sync>;

/// Feed a super-side store from a watch, optionally forwarding events.
pub fn spawn_super_reflector<K>(
    client: Client,
    store: Store<K>,
    cancel: CancellationToken,
    handler: Option<SuperEventHandler<K>>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let api: Api<K> = Api::all(client);
    tokio::spawn(async move {
        let mut stream = std::pin::pin!(watcher(api, watcher::Config::default()));
        let mut relist: Vec<K> = Vec::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(watcher::Event::Apply(object))) => {
                    if let Some(handler) = &handler {
                        handler(&object);
                    }
                    store.apply(object);
                }
                Some(Ok(watcher::Event::Delete(object))) => {
                    if let Some(handler) = &handler {
                        handler(&object);
                    }
                    store.delete(&object);
                }
                Some(Ok(watcher::Event::Init)) => relist = Vec::new(),
                Some(Ok(watcher::Event::InitApply(object))) => relist.push(object),
                Some(Ok(watcher::Event::InitDone)) => {
                    if let Some(handler) = &handler {
                        for object in &relist {
                            handler(object);
                        }
                    }
                    store.replace_all(std::mem::take(&mut relist));
                }
                Some(Err(err)) => {
                    warn!(error = %err, "super cluster watch error");
                }
                None => return,
            }
        }
    });
}

/// Manages the set of resource syncers: registers their listeners on the
/// bus and runs their loops until stop or first error.
pub struct SyncerManager {
    syncers: Vec<Arc<dyn ResourceSyncer>>,
    bus: Arc<ClusterChangeBus>,
}

impl SyncerManager {
    pub fn new(bus: Arc<ClusterChangeBus>) -> Self {
        Self {
            syncers: Vec::new(),
            bus,
        }
    }

    /// Build a manager from a registration table.
    pub fn from_registrations(
        context: &InitContext,
        registrations: &[Registration],
        bus: Arc<ClusterChangeBus>,
    ) -> Result<Self> {
        let mut manager = Self::new(bus);
        for registration in registrations {
            if registration.disable {
                continue;
            }
            let syncer = (registration.init)(context)?;
            info!(id = registration.id, "registered resource syncer");
            manager.add_resource_syncer(syncer);
        }
        Ok(manager)
    }

    pub fn add_resource_syncer(&mut self, syncer: Arc<dyn ResourceSyncer>) {
        self.bus.register(syncer.listener());
        self.syncers.push(syncer);
    }

    pub fn bus(&self) -> Arc<ClusterChangeBus> {
        Arc::clone(&self.bus)
    }

    pub fn len(&self) -> usize {
        self.syncers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syncers.is_empty()
    }

    /// Start every syncer's DWS, UWS and Patrol loops. Blocks until `stop`
    /// fires (returns `Ok`) or any loop returns an error (returns it).
    pub async fn start(&self, stop: CancellationToken) -> Result<()> {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        for syncer in &self.syncers {
            let dws = Arc::clone(syncer);
            let dws_stop = stop.clone();
            tasks.spawn(async move { dws.start_dws(dws_stop).await });

            let uws = Arc::clone(syncer);
            let uws_stop = stop.clone();
            tasks.spawn(async move { uws.start_uws(uws_stop).await });

            let patrol = Arc::clone(syncer);
            let patrol_stop = stop.clone();
            tasks.spawn(async move { patrol.start_patrol(patrol_stop).await });
        }

        loop {
            let joined = tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                joined = tasks.join_next() => joined,
            };
            match joined {
                None => return Ok(()),
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => {
                    stop.cancel();
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    stop.cancel();
                    return Err(SyncerError::Internal(format!(
                        "syncer loop panicked: {join_err}"
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullListener;

    impl ClusterChangeListener for NullListener {
        fn cluster_online(&self, _cluster: &Arc<crate::cluster::TenantCluster>) {}
        fn cluster_offline(&self, _cluster: &Arc<crate::cluster::TenantCluster>) {}
    }

    struct IdleSyncer;

    #[async_trait]
    impl ResourceSyncer for IdleSyncer {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn listener(&self) -> Arc<dyn ClusterChangeListener> {
            Arc::new(NullListener)
        }

        async fn start_dws(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
            stop.cancelled().await;
            Ok(())
        }

        async fn start_patrol(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
            stop.cancelled().await;
            Ok(())
        }
    }

    struct FailingSyncer;

    #[async_trait]
    impl ResourceSyncer for FailingSyncer {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn listener(&self) -> Arc<dyn ClusterChangeListener> {
            Arc::new(NullListener)
        }

        async fn start_dws(self: Arc<Self>, _stop: CancellationToken) -> Result<()> {
            Err(SyncerError::CacheSync)
        }

        async fn start_patrol(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
            stop.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_manager_registers_listeners() {
        let bus = ClusterChangeBus::new();
        let mut manager = SyncerManager::new(Arc::clone(&bus));
        manager.add_resource_syncer(Arc::new(IdleSyncer));
        assert_eq!(manager.len(), 1);
        assert_eq!(bus.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_returns_on_stop() {
        let bus = ClusterChangeBus::new();
        let mut manager = SyncerManager::new(bus);
        manager.add_resource_syncer(Arc::new(IdleSyncer));
        let stop = CancellationToken::new();
        let canceller = stop.clone();
        tokio::spawn(async move {
            canceller.cancel();
        });
        assert!(manager.start(stop).await.is_ok());
    }

    #[tokio::test]
    async fn test_manager_surfaces_first_error() {
        let bus = ClusterChangeBus::new();
        let mut manager = SyncerManager::new(bus);
        manager.add_resource_syncer(Arc::new(FailingSyncer));
        let stop = CancellationToken::new();
        let err = manager.start(stop).await.unwrap_err();
        assert!(matches!(err, SyncerError::CacheSync));
    }
}
