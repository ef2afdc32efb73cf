//! Service syncer
//!
//! Services sync downward like any namespaced kind, but the super master
//! owns the load-balancer machinery: assigned cluster IPs, ingress points
//! and status flow back upward. The patrol scan checks spec, status and
//! upward metadata separately and flags each into its own counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::PostParams;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cluster::Store;
use crate::conversion::{self, Equality};
use crate::health::SyncerMetrics;
use crate::syncer::error::{Result, SyncerError};
use crate::syncer::executor::{KubeExecutor, SuperDeleteOptions, SuperExecutor};
use crate::syncer::listener::{ClusterChangeListener, McListener};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::patrol::Patroller;
use crate::syncer::reconcile::{
    split_uw_key, DwReconciler, PatrolReconciler, ReconcileResult, Request, UwReconciler,
};
use crate::syncer::uw::UpwardController;
use crate::syncer::{InitContext, ResourceSyncer};

use super::{patrol_pairs, PatrolLabels};

const KIND: &str = "service";

/// A super service back-populates once the super master has assigned it a
/// cluster IP.
fn is_back_populate_service(p_service: &Service) -> bool {
    p_service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty())
}

pub struct ServiceSyncer {
    mc: Arc<MultiClusterController<Service>>,
    uw: Arc<UpwardController>,
    patroller: Arc<Patroller>,
    super_store: Store<Service>,
    executor: Arc<dyn SuperExecutor<Service>>,
    metrics: Arc<SyncerMetrics>,
}

impl ServiceSyncer {
    pub fn new(
        super_store: Store<Service>,
        executor: Arc<dyn SuperExecutor<Service>>,
        metrics: Arc<SyncerMetrics>,
        options: &crate::syncer::ResourceSyncerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mc: MultiClusterController::new(KIND, options.mc.clone()),
            uw: UpwardController::new(KIND, options.uw.clone()),
            patroller: Patroller::new(KIND, options.patrol.clone()),
            super_store,
            executor,
            metrics,
        })
    }

    pub fn register(context: &InitContext) -> Result<Arc<dyn ResourceSyncer>> {
        let client = context
            .super_client
            .clone()
            .ok_or_else(|| SyncerError::Internal("super cluster client required".to_string()))?;
        let syncer = Self::new(
            context.stores.services.clone(),
            KubeExecutor::<Service>::new(client.clone(), KIND),
            Arc::clone(&context.metrics),
            &context.options,
        );
        crate::syncer::spawn_super_reflector(
            client,
            context.stores.services.clone(),
            context.stop.child_token(),
            None,
        );
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<Service>> {
        Arc::clone(&self.mc)
    }

    pub fn uw(&self) -> Arc<UpwardController> {
        Arc::clone(&self.uw)
    }

    async fn reconcile_inner(&self, request: &Request) -> Result<ReconcileResult> {
        let target_namespace =
            conversion::to_super_namespace(&request.cluster_name, &request.namespace);
        let p_service = self.super_store.get(&target_namespace, &request.name);
        let v_service = self
            .mc
            .get(&request.cluster_name, &request.namespace, &request.name)?;

        match (v_service, p_service) {
            (Some(v), None) => self.reconcile_create(request, &target_namespace, &v).await,
            (None, Some(p)) => self.reconcile_remove(request, &target_namespace, &p).await,
            (Some(v), Some(p)) => {
                self.reconcile_update(request, &target_namespace, &p, &v)
                    .await
            }
            (None, None) => Ok(ReconcileResult::done()),
        }
    }

    async fn reconcile_create(
        &self,
        request: &Request,
        target_namespace: &str,
        v_service: &Service,
    ) -> Result<ReconcileResult> {
        if v_service.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let p_service =
            conversion::build_super_service(&request.cluster_name, &owner, v_service)?;
        self.executor.create(target_namespace, &p_service).await?;
        Ok(ReconcileResult::done())
    }

    async fn reconcile_update(
        &self,
        request: &Request,
        target_namespace: &str,
        p_service: &Service,
        v_service: &Service,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_service.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        if v_service.metadata.deletion_timestamp.is_some() {
            return self.reconcile_remove(request, target_namespace, p_service).await;
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let equality = Equality::new(&request.cluster_name, &owner);
        if let Some(updated) = equality.check_service_equality(p_service, v_service) {
            self.executor
                .update(target_namespace, &request.name, &updated)
                .await?;
        }
        Ok(ReconcileResult::done())
    }

    async fn reconcile_remove(
        &self,
        request: &Request,
        target_namespace: &str,
        p_service: &Service,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_service.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        // Already terminating; the delete has been issued.
        if p_service.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let options = SuperDeleteOptions {
            uid: p_service.metadata.uid.clone(),
            background: false,
        };
        self.executor
            .delete(target_namespace, &request.name, options)
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl DwReconciler for ServiceSyncer {
    async fn reconcile(&self, request: Request) -> Result<ReconcileResult> {
        let started = Instant::now();
        let result = self.reconcile_inner(&request).await;
        match &result {
            Ok(_) => self
                .metrics
                .record_reconcile(KIND, started.elapsed().as_secs_f64()),
            Err(_) => self.metrics.record_error(KIND),
        }
        result
    }
}

#[async_trait]
impl UwReconciler for ServiceSyncer {
    async fn back_populate(&self, key: &str) -> Result<()> {
        let (cluster_key, v_namespace, name) = split_uw_key(key)
            .ok_or_else(|| SyncerError::InvalidKey(key.to_string()))?;
        let target_namespace = conversion::to_super_namespace(&cluster_key, &v_namespace);
        let Some(p_service) = self.super_store.get(&target_namespace, &name) else {
            return Ok(());
        };
        let Some(v_service) = self.mc.get(&cluster_key, &v_namespace, &name)? else {
            return Ok(());
        };
        let v_uid = v_service.metadata.uid.clone().unwrap_or_default();
        if conversion::delegated_uid(&p_service.metadata) != v_uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name,
            });
        }

        let owner = self.mc.get_owner_info(&cluster_key)?;
        let equality = Equality::new(&cluster_key, &owner);
        let mut updated = (*v_service).clone();
        let mut changed = false;
        if let Some(meta) =
            equality.check_uw_object_meta_equality(&p_service.metadata, &v_service.metadata)
        {
            updated.metadata = meta;
            changed = true;
        }
        if v_service.status != p_service.status {
            updated.status = p_service.status.clone();
            changed = true;
        }
        if changed {
            let cluster = self
                .mc
                .get_cluster(&cluster_key)
                .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.clone()))?;
            let api = cluster.api_namespaced::<Service>(&v_namespace)?;
            api.replace(&name, &PostParams::default(), &updated).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PatrolReconciler for ServiceSyncer {
    async fn patroller_do(&self) {
        let status_miss = AtomicU64::new(0);
        let uw_meta_miss = AtomicU64::new(0);

        patrol_pairs(
            KIND,
            &self.mc,
            &self.super_store,
            &self.executor,
            &self.metrics,
            PatrolLabels {
                spec_miss: "SpecMissMatchedServices",
                requeued: "RequeuedTenantServices",
                orphan: "DeletedOrphanSuperMasterServices",
            },
            |cluster_key, owner, p, v| {
                Equality::new(cluster_key, owner)
                    .check_service_equality(p, v)
                    .is_some()
            },
            |cluster_key, owner, p, v| {
                if !is_back_populate_service(p) {
                    return;
                }
                let mut enqueue = false;
                let equality = Equality::new(cluster_key, owner);
                if equality
                    .check_uw_object_meta_equality(&p.metadata, &v.metadata)
                    .is_some()
                {
                    uw_meta_miss.fetch_add(1, Ordering::Relaxed);
                    enqueue = true;
                    warn!(kind = KIND, name = ?v.metadata.name,
                        "upward metadata differs between super and tenant master");
                }
                if v.status != p.status {
                    status_miss.fetch_add(1, Ordering::Relaxed);
                    enqueue = true;
                    warn!(kind = KIND, name = ?v.metadata.name,
                        "status differs between super and tenant master");
                }
                if enqueue {
                    let v_namespace = v.metadata.namespace.clone().unwrap_or_default();
                    let name = v.metadata.name.clone().unwrap_or_default();
                    self.uw
                        .add_to_queue(format!("{}/{}/{}", cluster_key, v_namespace, name));
                }
            },
        )
        .await;

        self.metrics.set_miss_match(
            "StatusMissMatchedServices",
            status_miss.load(Ordering::Relaxed),
        );
        self.metrics.set_miss_match(
            "UWMetaMissMatchedServices",
            uw_meta_miss.load(Ordering::Relaxed),
        );
    }
}

#[async_trait]
impl ResourceSyncer for ServiceSyncer {
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
