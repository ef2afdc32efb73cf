//! Namespace syncer
//!
//! A tenant namespace materializes on the super cluster under its derived
//! name `<clusterKey>-<name>`, carrying the virtual owner coordinates. The
//! kind is cluster-scoped, so requests have no namespace component and the
//! pairing is by derived name rather than by rewritten namespace.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::Store;
use crate::constants::LABEL_NAMESPACE;
use crate::conversion::{self, Equality};
use crate::health::SyncerMetrics;
use crate::syncer::error::{Result, SyncerError};
use crate::syncer::executor::{KubeClusterExecutor, SuperDeleteOptions, SuperExecutor};
use crate::syncer::listener::{ClusterChangeListener, McListener};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::patrol::Patroller;
use crate::syncer::reconcile::{DwReconciler, PatrolReconciler, ReconcileResult, Request};
use crate::syncer::{InitContext, ResourceSyncer};

const KIND: &str = "namespace";

pub struct NamespaceSyncer {
    mc: Arc<MultiClusterController<Namespace>>,
    patroller: Arc<Patroller>,
    super_store: Store<Namespace>,
    executor: Arc<dyn SuperExecutor<Namespace>>,
    metrics: Arc<SyncerMetrics>,
}

impl NamespaceSyncer {
    pub fn new(
        super_store: Store<Namespace>,
        executor: Arc<dyn SuperExecutor<Namespace>>,
        metrics: Arc<SyncerMetrics>,
        options: &crate::syncer::ResourceSyncerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mc: MultiClusterController::new(KIND, options.mc.clone()),
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
            context.stores.namespaces.clone(),
            KubeClusterExecutor::<Namespace>::new(client.clone(), KIND),
            Arc::clone(&context.metrics),
            &context.options,
        );
        crate::syncer::spawn_super_reflector(
            client,
            context.stores.namespaces.clone(),
            context.stop.child_token(),
            None,
        );
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<Namespace>> {
        Arc::clone(&self.mc)
    }

    async fn reconcile_inner(&self, request: &Request) -> Result<ReconcileResult> {
        let target_name = conversion::to_super_namespace(&request.cluster_name, &request.name);
        let p_namespace = self.super_store.get("", &target_name);
        let v_namespace = self.mc.get(&request.cluster_name, "", &request.name)?;

        match (v_namespace, p_namespace) {
            (Some(v), None) => self.reconcile_create(request, &v).await,
            (None, Some(p)) => self.reconcile_remove(request, &target_name, &p).await,
            (Some(v), Some(p)) => self.reconcile_update(request, &target_name, &p, &v).await,
            (None, None) => Ok(ReconcileResult::done()),
        }
    }

    async fn reconcile_create(
        &self,
        request: &Request,
        v_namespace: &Namespace,
    ) -> Result<ReconcileResult> {
        if v_namespace.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let p_namespace =
            conversion::build_super_namespace(&request.cluster_name, &owner, v_namespace);
        self.executor.create("", &p_namespace).await?;
        Ok(ReconcileResult::done())
    }

    async fn reconcile_update(
        &self,
        request: &Request,
        target_name: &str,
        p_namespace: &Namespace,
        v_namespace: &Namespace,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_namespace.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: target_name.to_string(),
            });
        }
        if v_namespace.metadata.deletion_timestamp.is_some() {
            return self.reconcile_remove(request, target_name, p_namespace).await;
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let equality = Equality::new(&request.cluster_name, &owner);
        if let Some(updated) = equality.check_namespace_equality(p_namespace, v_namespace) {
            self.executor.update("", target_name, &updated).await?;
        }
        Ok(ReconcileResult::done())
    }

    async fn reconcile_remove(
        &self,
        request: &Request,
        target_name: &str,
        p_namespace: &Namespace,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_namespace.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: target_name.to_string(),
            });
        }
        // Already terminating; the delete has been issued.
        if p_namespace.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let options = SuperDeleteOptions {
            uid: p_namespace.metadata.uid.clone(),
            background: true,
        };
        self.executor.delete("", target_name, options).await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl DwReconciler for NamespaceSyncer {
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
impl PatrolReconciler for NamespaceSyncer {
    async fn patroller_do(&self) {
        let cluster_names = self.mc.get_cluster_names();
        if cluster_names.is_empty() {
            info!(kind = KIND, "no tenant clusters joined, skipping patrol scan");
            return;
        }

        let mut spec_miss = 0u64;

        for cluster_key in &cluster_names {
            let (owner, v_namespaces) = match (
                self.mc.get_owner_info(cluster_key),
                self.mc.list(cluster_key),
            ) {
                (Ok(owner), Ok(list)) => (owner, list),
                _ => {
                    warn!(kind = KIND, cluster = %cluster_key, "tenant cache unavailable, skipping cluster");
                    continue;
                }
            };
            for v_namespace in v_namespaces {
                let v_name = v_namespace.metadata.name.clone().unwrap_or_default();
                let v_uid = v_namespace.metadata.uid.clone().unwrap_or_default();
                let target_name = conversion::to_super_namespace(cluster_key, &v_name);

                let Some(p_namespace) = self.super_store.get("", &target_name) else {
                    if self.mc.requeue_object(cluster_key, &v_namespace).is_ok() {
                        self.metrics.inc_remedy("RequeuedTenantNamespaces");
                    }
                    continue;
                };
                if conversion::delegated_uid(&p_namespace.metadata) != v_uid {
                    error!(kind = KIND, name = %target_name,
                        "delegated UID is different from tenant object");
                    continue;
                }
                if Equality::new(cluster_key, &owner)
                    .check_namespace_equality(&p_namespace, &v_namespace)
                    .is_some()
                {
                    spec_miss += 1;
                    if self.mc.requeue_object(cluster_key, &v_namespace).is_ok() {
                        self.metrics.inc_remedy("RequeuedTenantNamespaces");
                    }
                }
            }
        }

        for p_namespace in self.super_store.list() {
            let Some((cluster_key, _)) = conversion::get_virtual_owner(&p_namespace.metadata)
            else {
                continue;
            };
            let v_name = p_namespace
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(LABEL_NAMESPACE))
                .cloned()
                .unwrap_or_default();
            let p_name = p_namespace.metadata.name.clone().unwrap_or_default();

            let should_delete = match self.mc.get(&cluster_key, "", &v_name) {
                Ok(None) => true,
                Ok(Some(v)) => {
                    conversion::delegated_uid(&p_namespace.metadata)
                        != v.metadata.uid.clone().unwrap_or_default()
                }
                Err(_) => false,
            };
            if should_delete {
                let options = SuperDeleteOptions {
                    uid: p_namespace.metadata.uid.clone(),
                    background: true,
                };
                match self.executor.delete("", &p_name, options).await {
                    Ok(()) => self.metrics.inc_remedy("DeletedOrphanSuperMasterNamespaces"),
                    Err(err) => {
                        error!(kind = KIND, name = %p_name, error = %err,
                            "error deleting orphan super namespace");
                    }
                }
            }
        }

        self.metrics
            .set_miss_match("SpecMissMatchedNamespaces", spec_miss);
    }
}

#[async_trait]
impl ResourceSyncer for NamespaceSyncer {
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

    async fn start_patrol(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let patroller = Arc::clone(&self.patroller);
        patroller.start(self, stop).await
    }
}
