//! PriorityClass syncer
//!
//! Mirrors the StorageClass flow: super-cluster objects carrying the public
//! marker fan out upward to every joined tenant, keyed `cluster/name`.
//! Tenant-side writes are never propagated downward.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::{DeleteParams, PostParams};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::Store;
use crate::constants::PUBLIC_OBJECT_KEY;
use crate::conversion::equality::{check_priority_class_equality, tenant_priority_class};
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

const KIND: &str = "priorityclass";

pub(crate) fn is_public_priority_class(priority_class: &PriorityClass) -> bool {
    priority_class
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(PUBLIC_OBJECT_KEY))
        .map(String::as_str)
        == Some("true")
}

pub struct PriorityClassSyncer {
    mc: Arc<MultiClusterController<PriorityClass>>,
    uw: Arc<UpwardController>,
    patroller: Arc<Patroller>,
    super_store: Store<PriorityClass>,
    metrics: Arc<SyncerMetrics>,
}

impl PriorityClassSyncer {
    pub fn new(
        super_store: Store<PriorityClass>,
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
            context.stores.priority_classes.clone(),
            Arc::clone(&context.metrics),
            &context.options,
        );
        if let Some(client) = context.super_client.clone() {
            crate::syncer::spawn_super_reflector(
                client,
                context.stores.priority_classes.clone(),
                context.stop.child_token(),
                Some(Self::super_event_handler(&syncer)),
            );
        }
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<PriorityClass>> {
        Arc::clone(&self.mc)
    }

    pub fn uw(&self) -> Arc<UpwardController> {
        Arc::clone(&self.uw)
    }

    /// Handler for the super-store reflector: every public object change
    /// fans out one upward key per joined tenant.
    pub fn super_event_handler(syncer: &Arc<Self>) -> SuperEventHandler<PriorityClass> {
        let syncer = Arc::clone(syncer);
        Arc::new(move |priority_class: &PriorityClass| {
            syncer.enqueue_super_object(priority_class);
        })
    }

    pub fn enqueue_super_object(&self, priority_class: &PriorityClass) {
        if !is_public_priority_class(priority_class) {
            return;
        }
        let name = priority_class.metadata.name.clone().unwrap_or_default();
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
impl DwReconciler for PriorityClassSyncer {
    /// Downward sync is quiescent for this kind.
    async fn reconcile(&self, _request: Request) -> Result<ReconcileResult> {
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl UwReconciler for PriorityClassSyncer {
    async fn back_populate(&self, key: &str) -> Result<()> {
        let (cluster_key, _, name) = split_uw_key(key)
            .ok_or_else(|| SyncerError::InvalidKey(key.to_string()))?;
        let cluster = self
            .mc
            .get_cluster(&cluster_key)
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.clone()))?;
        let p_priority_class = self
            .super_store
            .get("", &name)
            .filter(|pc| is_public_priority_class(pc));
        let v_priority_class = self.mc.get(&cluster_key, "", &name)?;
        let api = cluster.api_cluster::<PriorityClass>()?;

        match (p_priority_class, v_priority_class) {
            (Some(p), None) => {
                api.create(&PostParams::default(), &tenant_priority_class(&p))
                    .await?;
                self.metrics.inc_remedy("BackPopulatedPriorityClasses");
            }
            (Some(p), Some(v)) => {
                if let Some(updated) = check_priority_class_equality(&p, &v) {
                    api.replace(&name, &PostParams::default(), &updated).await?;
                    self.metrics.inc_remedy("BackPopulatedPriorityClasses");
                }
            }
            (None, Some(_)) => {
                match api.delete(&name, &DeleteParams::default()).await {
                    Ok(_) => self.metrics.inc_remedy("DeletedOrphanTenantPriorityClasses"),
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
impl PatrolReconciler for PriorityClassSyncer {
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
            .filter(|pc| is_public_priority_class(pc))
            .collect();

        for cluster_key in &cluster_names {
            let v_priority_classes = match self.mc.list(cluster_key) {
                Ok(list) => list,
                Err(err) => {
                    warn!(kind = KIND, cluster = %cluster_key, error = %err,
                        "tenant cache unavailable, skipping cluster");
                    continue;
                }
            };

            for p_priority_class in &public {
                let name = p_priority_class.metadata.name.clone().unwrap_or_default();
                let drifted = match v_priority_classes
                    .iter()
                    .find(|v| v.metadata.name.as_deref() == Some(name.as_str()))
                {
                    None => true,
                    Some(v) => check_priority_class_equality(p_priority_class, v).is_some(),
                };
                if drifted {
                    spec_miss += 1;
                    self.uw.add_to_queue(format!("{}/{}", cluster_key, name));
                }
            }

            for v_priority_class in &v_priority_classes {
                let name = v_priority_class.metadata.name.clone().unwrap_or_default();
                let still_public = public
                    .iter()
                    .any(|p| p.metadata.name.as_deref() == Some(name.as_str()));
                if !still_public {
                    self.uw.add_to_queue(format!("{}/{}", cluster_key, name));
                }
            }
        }

        self.metrics
            .set_miss_match("SpecMissMatchedPriorityClasses", spec_miss);
    }
}

#[async_trait]
impl ResourceSyncer for PriorityClassSyncer {
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
