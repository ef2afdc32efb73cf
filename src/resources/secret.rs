//! Secret syncer
//!
//! Normal secrets sync downward by name. Service-account-token secrets are
//! special: the super master owns that type, so the tenant token is
//! projected as an `Opaque` secret with a generated name, tagged with the
//! tenant secret's UID (`LABEL_SECRET_UID`). Pod syncing resolves the
//! projection through that label.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cluster::Store;
use crate::constants::LABEL_SECRET_UID;
use crate::conversion::{self, Equality};
use crate::health::SyncerMetrics;
use crate::syncer::error::{Result, SyncerError};
use crate::syncer::executor::{KubeExecutor, SuperDeleteOptions, SuperExecutor};
use crate::syncer::listener::{ClusterChangeListener, McListener};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::patrol::Patroller;
use crate::syncer::reconcile::{DwReconciler, PatrolReconciler, ReconcileResult, Request};
use crate::syncer::{InitContext, ResourceSyncer};

const KIND: &str = "secret";
const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

fn is_service_account_token(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(SERVICE_ACCOUNT_TOKEN_TYPE)
}

pub struct SecretSyncer {
    mc: Arc<MultiClusterController<Secret>>,
    patroller: Arc<Patroller>,
    super_store: Store<Secret>,
    executor: Arc<dyn SuperExecutor<Secret>>,
    metrics: Arc<SyncerMetrics>,
}

impl SecretSyncer {
    pub fn new(
        super_store: Store<Secret>,
        executor: Arc<dyn SuperExecutor<Secret>>,
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
            context.stores.secrets.clone(),
            KubeExecutor::<Secret>::new(client.clone(), KIND),
            Arc::clone(&context.metrics),
            &context.options,
        );
        crate::syncer::spawn_super_reflector(
            client,
            context.stores.secrets.clone(),
            context.stop.child_token(),
            None,
        );
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<Secret>> {
        Arc::clone(&self.mc)
    }

    /// Locate the opaque projection of a tenant token secret by its UID tag.
    fn find_token_projection(&self, target_namespace: &str, v_uid: &str) -> Option<Arc<Secret>> {
        if v_uid.is_empty() {
            return None;
        }
        self.super_store.list().into_iter().find(|p| {
            p.metadata.namespace.as_deref() == Some(target_namespace)
                && p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_SECRET_UID))
                    .map(String::as_str)
                    == Some(v_uid)
        })
    }

    async fn reconcile_inner(&self, request: &Request) -> Result<ReconcileResult> {
        let target_namespace =
            conversion::to_super_namespace(&request.cluster_name, &request.namespace);
        let p_secret = self
            .super_store
            .get(&target_namespace, &request.name)
            .or_else(|| self.find_token_projection(&target_namespace, &request.uid));
        let v_secret = self
            .mc
            .get(&request.cluster_name, &request.namespace, &request.name)?;

        match (v_secret, p_secret) {
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
        v_secret: &Secret,
    ) -> Result<ReconcileResult> {
        if v_secret.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let p_secret = conversion::build_super_secret(&request.cluster_name, &owner, v_secret)?;
        self.executor.create(target_namespace, &p_secret).await?;
        Ok(ReconcileResult::done())
    }

    async fn reconcile_update(
        &self,
        request: &Request,
        target_namespace: &str,
        p_secret: &Secret,
        v_secret: &Secret,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_secret.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        if v_secret.metadata.deletion_timestamp.is_some() {
            return self.reconcile_remove(request, target_namespace, p_secret).await;
        }
        if is_service_account_token(v_secret) {
            // Projection name is generated; only the payload syncs.
            if p_secret.data != v_secret.data {
                let mut updated = p_secret.clone();
                updated.data = v_secret.data.clone();
                let p_name = updated.metadata.name.clone().unwrap_or_default();
                self.executor
                    .update(target_namespace, &p_name, &updated)
                    .await?;
            }
            return Ok(ReconcileResult::done());
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let equality = Equality::new(&request.cluster_name, &owner);
        if let Some(updated) = equality.check_secret_equality(p_secret, v_secret) {
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
        p_secret: &Secret,
    ) -> Result<ReconcileResult> {
        let delegated = conversion::delegated_uid(&p_secret.metadata);
        if delegated != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        // Already terminating; the delete has been issued.
        if p_secret.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let p_name = p_secret.metadata.name.clone().unwrap_or_default();
        let options = SuperDeleteOptions {
            uid: p_secret.metadata.uid.clone(),
            background: false,
        };
        self.executor
            .delete(target_namespace, &p_name, options)
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl DwReconciler for SecretSyncer {
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
impl PatrolReconciler for SecretSyncer {
    async fn patroller_do(&self) {
        let cluster_names = self.mc.get_cluster_names();
        if cluster_names.is_empty() {
            info!(kind = KIND, "no tenant clusters joined, skipping patrol scan");
            return;
        }

        let mut spec_miss = 0u64;

        for cluster_key in &cluster_names {
            let (owner, v_secrets) = match (
                self.mc.get_owner_info(cluster_key),
                self.mc.list(cluster_key),
            ) {
                (Ok(owner), Ok(list)) => (owner, list),
                _ => {
                    warn!(kind = KIND, cluster = %cluster_key, "tenant cache unavailable, skipping cluster");
                    continue;
                }
            };
            for v_secret in v_secrets {
                let v_namespace = v_secret.metadata.namespace.clone().unwrap_or_default();
                let v_name = v_secret.metadata.name.clone().unwrap_or_default();
                let v_uid = v_secret.metadata.uid.clone().unwrap_or_default();
                let target_namespace = conversion::to_super_namespace(cluster_key, &v_namespace);

                let p_secret = if is_service_account_token(&v_secret) {
                    self.find_token_projection(&target_namespace, &v_uid)
                } else {
                    self.super_store.get(&target_namespace, &v_name)
                };
                let Some(p_secret) = p_secret else {
                    if self.mc.requeue_object(cluster_key, &v_secret).is_ok() {
                        self.metrics.inc_remedy("RequeuedTenantSecrets");
                    }
                    continue;
                };

                if !is_service_account_token(&v_secret)
                    && conversion::delegated_uid(&p_secret.metadata) != v_uid
                {
                    error!(kind = KIND, namespace = %target_namespace, name = %v_name,
                        "delegated UID is different from tenant object");
                    continue;
                }

                let drifted = if is_service_account_token(&v_secret) {
                    p_secret.data != v_secret.data
                } else {
                    Equality::new(cluster_key, &owner)
                        .check_secret_equality(&p_secret, &v_secret)
                        .is_some()
                };
                if drifted {
                    spec_miss += 1;
                    if self.mc.requeue_object(cluster_key, &v_secret).is_ok() {
                        self.metrics.inc_remedy("RequeuedTenantSecrets");
                    }
                }
            }
        }

        for p_secret in self.super_store.list() {
            let Some((cluster_key, v_namespace)) =
                conversion::get_virtual_owner(&p_secret.metadata)
            else {
                continue;
            };
            let p_namespace = p_secret.metadata.namespace.clone().unwrap_or_default();
            let p_name = p_secret.metadata.name.clone().unwrap_or_default();

            let projection_uid = p_secret
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_SECRET_UID))
                .cloned();
            let should_delete = match &projection_uid {
                // Projection: the tenant counterpart is found by UID.
                Some(uid) => match self.mc.list(&cluster_key) {
                    Ok(v_secrets) => !v_secrets.iter().any(|v| {
                        v.metadata.namespace.as_deref() == Some(v_namespace.as_str())
                            && v.metadata.uid.as_deref() == Some(uid.as_str())
                    }),
                    Err(_) => false,
                },
                None => match self.mc.get(&cluster_key, &v_namespace, &p_name) {
                    Ok(None) => true,
                    Ok(Some(v)) => {
                        conversion::delegated_uid(&p_secret.metadata)
                            != v.metadata.uid.clone().unwrap_or_default()
                    }
                    Err(_) => false,
                },
            };
            if should_delete {
                let options = SuperDeleteOptions {
                    uid: p_secret.metadata.uid.clone(),
                    background: false,
                };
                match self.executor.delete(&p_namespace, &p_name, options).await {
                    Ok(()) => self.metrics.inc_remedy("DeletedOrphanSuperMasterSecrets"),
                    Err(err) => {
                        error!(kind = KIND, namespace = %p_namespace, name = %p_name, error = %err,
                            "error deleting orphan super secret");
                    }
                }
            }
        }

        self.metrics.set_miss_match("SpecMissMatchedSecrets", spec_miss);
    }
}

#[async_trait]
impl ResourceSyncer for SecretSyncer {
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
