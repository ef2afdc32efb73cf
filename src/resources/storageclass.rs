//! StorageClass syncer
//!
//! StorageClasses belong to the super cluster. Only objects opted in with
//! the public marker fan out upward to every joined tenant; tenants never
//! sync them downward. The upward key form is `cluster/name`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::Store;
use crate::constants::PUBLIC_OBJECT_KEY;
use crate::conversion::equality::{check_storage_class_equality, tenant_storage_class};
use crate::health::SyncerMetrics;
use crate::syncer::error::{is_not_found, Result, SyncerError};
use crate::syncer::listener::{ClusterChangeListener, McListener};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::patrol::Patroller;
use crate::syncer::reconcile::{
    split_uw_key, DwReconciler, PatrolReconciler, ReconcileResult, Request, UwReconciler,
};
use crate::syncer::uw::UpwardController;
use crate::syncer::{InitContext, ResourceSyncer, SuperEventHandler};

const KIND: &str = "storageclass";

pub(crate) fn is_public_storage_class(storage_class: &StorageClass) -> bool {
    storage_class
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(PUBLIC_OBJECT_KEY))
        .map(String::as_str)
        == Some("true")
}

pub struct StorageClassSyncer {
    mc: Arc<MultiClusterController<StorageClass>>,
    uw: Arc<UpwardController>,
    patroller: Arc<Patroller>,
    super_store: Store<StorageClass>,
    metrics: Arc<SyncerMetrics>,
}

impl StorageClassSyncer {
    pub fn new(
        super_store: Store<StorageClass>,
        metrics: Arc<SyncerMetrics>,
        options: &crate::syncer::ResourceSyncerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mc: MultiClusterController::new(KIND, options.mc.clone()),
            uw: UpwardController::new(KIND, options.uw.clone()),
            patroller: Patroller::new(KIND, options.patrol.clone()),
            super_store,
            metrics,
        })
    }

    pub fn register(context: &InitContext) -> Result<Arc<dyn ResourceSyncer>> {
        let syncer = Self::new(
            context.stores.storage_classes.clone(),
            Arc::clone(&context.metrics),
            &context.options,
        );
        if let Some(client) = context.super_client.clone() {
            crate::syncer::spawn_super_reflector(
                client,
                context.stores.storage_classes.clone(),
                context.stop.child_token(),
                Some(Self::super_event_handler(&syncer)),
            );
        }
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<StorageClass>> {
        Arc::clone(&self.mc)
    }

    pub fn uw(&self) -> Arc<UpwardController> {
        Arc::clone(&self.uw)
    }

    /// Handler for the super-store reflector: every public object change
    /// fans out one upward key per joined tenant.
    pub fn super_event_handler(syncer: &Arc<Self>) -> SuperEventHandler<StorageClass> {
        let syncer = Arc::clone(syncer);
        Arc::new(move |storage_class: &StorageClass| {
            syncer.enqueue_super_object(storage_class);
        })
    }

    pub fn enqueue_super_object(&self, storage_class: &StorageClass) {
        if !is_public_storage_class(storage_class) {
            return;
        }
        let name = storage_class.metadata.name.clone().unwrap_or_default();
        let cluster_names = self.mc.get_cluster_names();
        if cluster_names.is_empty() {
            info!(kind = KIND, name = %name, "no tenant masters, skipping back populate");
            return;
        }
        for cluster_key in cluster_names {
            self.uw.add_to_queue(format!("{}/{}", cluster_key, name));
        }
    }
}

#[async_trait]
impl DwReconciler for StorageClassSyncer {
    /// Tenant-side writes are not propagated; the patroller drives the
    /// tenant copies back to the public super state through the upward
    /// queue.
    async fn reconcile(&self, _request: Request) -> Result<ReconcileResult> {
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl UwReconciler for StorageClassSyncer {
    async fn back_populate(&self, key: &str) -> Result<()> {
        let (cluster_key, _, name) = split_uw_key(key)
            .ok_or_else(|| SyncerError::InvalidKey(key.to_string()))?;
        let cluster = self
            .mc
            .get_cluster(&cluster_key)
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.clone()))?;
        let p_storage_class = self
            .super_store
            .get("", &name)
            .filter(|sc| is_public_storage_class(sc));
        let v_storage_class = self.mc.get(&cluster_key, "", &name)?;
        let api = cluster.api_cluster::<StorageClass>()?;

        match (p_storage_class, v_storage_class) {
            (Some(p), None) => {
                api.create(&PostParams::default(), &tenant_storage_class(&p))
                    .await?;
                self.metrics.inc_remedy("BackPopulatedStorageClasses");
            }
            (Some(p), Some(v)) => {
                if let Some(updated) = check_storage_class_equality(&p, &v) {
                    api.replace(&name, &PostParams::default(), &updated).await?;
                    self.metrics.inc_remedy("BackPopulatedStorageClasses");
                }
            }
            (None, Some(_)) => {
                // No longer public (or gone): retract the tenant copy.
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => self.metrics.inc_remedy("DeletedOrphanTenantStorageClasses"),
                    Err(err) if is_not_found(&err) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            (None, None) => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PatrolReconciler for StorageClassSyncer {
    async fn patroller_do(&self) {
        let cluster_names = self.mc.get_cluster_names();
        if cluster_names.is_empty() {
            info!(kind = KIND, "no tenant clusters joined, skipping patrol scan");
            return;
        }

        let mut spec_miss = 0u64;
        let public: Vec<_> = self
            .super_store
            .list()
            .into_iter()
            .filter(|sc| is_public_storage_class(sc))
            .collect();

        for cluster_key in &cluster_names {
            let v_storage_classes = match self.mc.list(cluster_key) {
                Ok(list) => list,
                Err(err) => {
                    warn!(kind = KIND, cluster = %cluster_key, error = %err,
                        "tenant cache unavailable, skipping cluster");
                    continue;
                }
            };

            for p_storage_class in &public {
                let name = p_storage_class.metadata.name.clone().unwrap_or_default();
                let drifted = match v_storage_classes
                    .iter()
                    .find(|v| v.metadata.name.as_deref() == Some(name.as_str()))
                {
                    None => true,
                    Some(v) => check_storage_class_equality(p_storage_class, v).is_some(),
                };
                if drifted {
                    spec_miss += 1;
                    self.uw.add_to_queue(format!("{}/{}", cluster_key, name));
                }
            }

            // Tenant copies whose super object is gone or no longer public.
            for v_storage_class in &v_storage_classes {
                let name = v_storage_class.metadata.name.clone().unwrap_or_default();
                let still_public = public
                    .iter()
                    .any(|p| p.metadata.name.as_deref() == Some(name.as_str()));
                if !still_public {
                    self.uw.add_to_queue(format!("{}/{}", cluster_key, name));
                }
            }
        }

        self.metrics
            .set_miss_match("SpecMissMatchedStorageClasses", spec_miss);
    }
}

#[async_trait]
impl ResourceSyncer for StorageClassSyncer {
    fn name(&self) -> &'static str {
        KIND
    }

    fn listener(&self) -> Arc<dyn ClusterChangeListener> {
        Arc::new(McListener(Arc::clone(&self.mc)))
    }

    async fn start_dws(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let mc = Arc::clone(&self.mc);
        mc.start(self, stop).await
    }

    async fn start_uws(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let uw = Arc::clone(&self.uw);
        uw.start(self, stop).await
    }

    async fn start_patrol(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let patroller = Arc::clone(&self.patroller);
        patroller.start(self, stop).await
    }
}
