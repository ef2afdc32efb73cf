//! ConfigMap syncer
//!
//! ConfigMaps sync downward only: the tenant owns the payload, the super
//! copy exists so workloads can mount it. The patroller remediates drift
//! and deletes orphans.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use tokio_util::sync::CancellationToken;

use crate::cluster::Store;
use crate::conversion::{self, Equality};
use crate::health::SyncerMetrics;
use crate::syncer::error::{Result, SyncerError};
use crate::syncer::executor::{KubeExecutor, SuperDeleteOptions, SuperExecutor};
use crate::syncer::listener::{ClusterChangeListener, McListener};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::patrol::Patroller;
use crate::syncer::reconcile::{DwReconciler, PatrolReconciler, ReconcileResult, Request};
use crate::syncer::{InitContext, ResourceSyncer};

use super::{patrol_pairs, PatrolLabels};

const KIND: &str = "configmap";

pub struct ConfigMapSyncer {
    mc: Arc<MultiClusterController<ConfigMap>>,
    patroller: Arc<Patroller>,
    super_store: Store<ConfigMap>,
    executor: Arc<dyn SuperExecutor<ConfigMap>>,
    metrics: Arc<SyncerMetrics>,
}

impl ConfigMapSyncer {
    pub fn new(
        super_store: Store<ConfigMap>,
        executor: Arc<dyn SuperExecutor<ConfigMap>>,
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
            context.stores.configmaps.clone(),
            KubeExecutor::<ConfigMap>::new(client.clone(), KIND),
            Arc::clone(&context.metrics),
            &context.options,
        );
        crate::syncer::spawn_super_reflector(
            client,
            context.stores.configmaps.clone(),
            context.stop.child_token(),
            None,
        );
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<ConfigMap>> {
        Arc::clone(&self.mc)
    }

    async fn reconcile_inner(&self, request: &Request) -> Result<ReconcileResult> {
        let target_namespace =
            conversion::to_super_namespace(&request.cluster_name, &request.namespace);
        let p_configmap = self.super_store.get(&target_namespace, &request.name);
        let v_configmap = self
            .mc
            .get(&request.cluster_name, &request.namespace, &request.name)?;

        match (v_configmap, p_configmap) {
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
        v_configmap: &ConfigMap,
    ) -> Result<ReconcileResult> {
        if v_configmap.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let p_configmap = ConfigMap {
            metadata: conversion::build_super_meta(
                &request.cluster_name,
                &owner,
                target_namespace,
                &v_configmap.metadata,
            )?,
            data: v_configmap.data.clone(),
            binary_data: v_configmap.binary_data.clone(),
            immutable: v_configmap.immutable,
        };
        self.executor.create(target_namespace, &p_configmap).await?;
        Ok(ReconcileResult::done())
    }

    async fn reconcile_update(
        &self,
        request: &Request,
        target_namespace: &str,
        p_configmap: &ConfigMap,
        v_configmap: &ConfigMap,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_configmap.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        if v_configmap.metadata.deletion_timestamp.is_some() {
            return self.reconcile_remove(request, target_namespace, p_configmap).await;
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let equality = Equality::new(&request.cluster_name, &owner);
        if let Some(updated) = equality.check_configmap_equality(p_configmap, v_configmap) {
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
        p_configmap: &ConfigMap,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_configmap.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        // Already terminating; the delete has been issued.
        if p_configmap.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let options = SuperDeleteOptions {
            uid: p_configmap.metadata.uid.clone(),
            background: false,
        };
        self.executor
            .delete(target_namespace, &request.name, options)
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl DwReconciler for ConfigMapSyncer {
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
impl PatrolReconciler for ConfigMapSyncer {
    async fn patroller_do(&self) {
        patrol_pairs(
            KIND,
            &self.mc,
            &self.super_store,
            &self.executor,
            &self.metrics,
            PatrolLabels {
                spec_miss: "SpecMissMatchedConfigMaps",
                requeued: "RequeuedTenantConfigMaps",
                orphan: "DeletedOrphanSuperMasterConfigMaps",
            },
            |cluster_key, owner, p, v| {
                Equality::new(cluster_key, owner)
                    .check_configmap_equality(p, v)
                    .is_some()
            },
            |_, _, _, _| {},
        )
        .await;
    }
}

#[async_trait]
impl ResourceSyncer for ConfigMapSyncer {
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
