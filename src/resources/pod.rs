//! Pod syncer
//!
//! Creating a pod downward is the one place the syncer stitches several
//! caches together: the tenant service-account token volume is swapped for
//! the super-side projection, and the pod is only admitted once either the
//! super `kubernetes` service or the tenant DNS service is ready, so the
//! workload can resolve its control plane from the first instruction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, Service, ServiceAccount};
use kube::api::PostParams;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cluster::{Store, TenantCluster};
use crate::constants::{
    KUBERNETES_SERVICE_NAME, LABEL_SECRET_UID, TENANT_DNS_SERVER_NS,
    TENANT_DNS_SERVER_SERVICE_NAME,
};
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

const KIND: &str = "pod";

pub struct PodSyncer {
    mc: Arc<MultiClusterController<Pod>>,
    uw: Arc<UpwardController>,
    patroller: Arc<Patroller>,
    super_store: Store<Pod>,
    super_services: Store<Service>,
    super_secrets: Store<Secret>,
    executor: Arc<dyn SuperExecutor<Pod>>,
    metrics: Arc<SyncerMetrics>,
}

impl PodSyncer {
    pub fn new(
        super_store: Store<Pod>,
        super_services: Store<Service>,
        super_secrets: Store<Secret>,
        executor: Arc<dyn SuperExecutor<Pod>>,
        metrics: Arc<SyncerMetrics>,
        options: &crate::syncer::ResourceSyncerOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            mc: MultiClusterController::new(KIND, options.mc.clone()),
            uw: UpwardController::new(KIND, options.uw.clone()),
            patroller: Patroller::new(KIND, options.patrol.clone()),
            super_store,
            super_services,
            super_secrets,
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
            context.stores.pods.clone(),
            context.stores.services.clone(),
            context.stores.secrets.clone(),
            KubeExecutor::<Pod>::new(client.clone(), KIND),
            Arc::clone(&context.metrics),
            &context.options,
        );
        crate::syncer::spawn_super_reflector(
            client,
            context.stores.pods.clone(),
            context.stop.child_token(),
            None,
        );
        Ok(syncer)
    }

    pub fn mc(&self) -> Arc<MultiClusterController<Pod>> {
        Arc::clone(&self.mc)
    }

    /// The tenant SA-token secret the pod mounts, resolved through the pod's
    /// service account.
    fn tenant_token_secret(
        &self,
        cluster: &Arc<TenantCluster>,
        namespace: &str,
        account: &str,
    ) -> Result<Arc<Secret>> {
        let missing = || SyncerError::TenantTokenSecretMissing {
            account: account.to_string(),
            namespace: namespace.to_string(),
        };
        let service_account = cluster
            .store::<ServiceAccount>()
            .get(namespace, account)
            .ok_or_else(missing)?;
        let secret_name = service_account
            .secrets
            .as_ref()
            .and_then(|refs| refs.first())
            .and_then(|reference| reference.name.clone())
            .ok_or_else(missing)?;
        cluster
            .store::<Secret>()
            .get(namespace, &secret_name)
            .ok_or_else(missing)
    }

    /// The super-side projection of a tenant token secret, located by the
    /// tenant secret's UID tag.
    fn super_token_secret(&self, target_namespace: &str, v_secret_uid: &str) -> Result<Arc<Secret>> {
        self.super_secrets
            .list()
            .into_iter()
            .find(|p| {
                p.metadata.namespace.as_deref() == Some(target_namespace)
                    && p.metadata
                        .labels
                        .as_ref()
                        .and_then(|l| l.get(LABEL_SECRET_UID))
                        .map(String::as_str)
                        == Some(v_secret_uid)
            })
            .ok_or_else(|| SyncerError::SuperTokenSecretMissing(target_namespace.to_string()))
    }

    /// A pod can only start once at least one API service is reachable:
    /// the super `kubernetes` service in the derived default namespace, or
    /// the tenant DNS service in `kube-system`. Returns the service's
    /// cluster IP when it has one, for the host alias.
    fn ready_service_ip(&self, cluster_key: &str) -> Result<Option<String>> {
        let super_default = conversion::to_super_namespace(cluster_key, "default");
        if let Some(service) = self
            .super_services
            .get(&super_default, KUBERNETES_SERVICE_NAME)
        {
            return Ok(cluster_ip(&service));
        }
        let super_dns_namespace = conversion::to_super_namespace(cluster_key, TENANT_DNS_SERVER_NS);
        if let Some(service) = self
            .super_services
            .get(&super_dns_namespace, TENANT_DNS_SERVER_SERVICE_NAME)
        {
            return Ok(cluster_ip(&service));
        }
        Err(SyncerError::ServiceNotReady(cluster_key.to_string()))
    }

    async fn reconcile_inner(&self, request: &Request) -> Result<ReconcileResult> {
        let target_namespace =
            conversion::to_super_namespace(&request.cluster_name, &request.namespace);
        let p_pod = self.super_store.get(&target_namespace, &request.name);
        let v_pod = self
            .mc
            .get(&request.cluster_name, &request.namespace, &request.name)?;

        match (v_pod, p_pod) {
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
        v_pod: &Pod,
    ) -> Result<ReconcileResult> {
        // A tenant pod already terminating is never projected.
        if v_pod.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        // A pod bound before the syncer saw it belongs to a node this
        // syncer does not manage.
        if v_pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some()
        {
            return Ok(ReconcileResult::done());
        }

        let cluster = self
            .mc
            .get_cluster(&request.cluster_name)
            .ok_or_else(|| SyncerError::ClusterNotJoined(request.cluster_name.clone()))?;
        let owner = cluster.owner_info();

        let account = v_pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone())
            .unwrap_or_else(|| "default".to_string());
        let v_secret = self.tenant_token_secret(&cluster, &request.namespace, &account)?;
        let v_secret_name = v_secret.metadata.name.clone().unwrap_or_default();
        let v_secret_uid = v_secret.metadata.uid.clone().unwrap_or_default();
        let p_secret = self.super_token_secret(target_namespace, &v_secret_uid)?;
        let p_secret_name = p_secret.metadata.name.clone().unwrap_or_default();

        let service_ip = self.ready_service_ip(&request.cluster_name)?;

        let p_pod = conversion::build_super_pod(
            &request.cluster_name,
            &owner,
            v_pod,
            &v_secret_name,
            &p_secret_name,
            service_ip.as_deref(),
        )?;
        self.executor.create(target_namespace, &p_pod).await?;
        Ok(ReconcileResult::done())
    }

    async fn reconcile_update(
        &self,
        request: &Request,
        target_namespace: &str,
        p_pod: &Pod,
        v_pod: &Pod,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_pod.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        if v_pod.metadata.deletion_timestamp.is_some() {
            return self.reconcile_remove(request, target_namespace, p_pod).await;
        }
        let owner = self.mc.get_owner_info(&request.cluster_name)?;
        let equality = Equality::new(&request.cluster_name, &owner);
        if let Some(updated) = equality.check_pod_equality(p_pod, v_pod) {
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
        p_pod: &Pod,
    ) -> Result<ReconcileResult> {
        if conversion::delegated_uid(&p_pod.metadata) != request.uid {
            return Err(SyncerError::UidMismatch {
                kind: KIND,
                name: request.name.clone(),
            });
        }
        // Already terminating; the delete has been issued.
        if p_pod.metadata.deletion_timestamp.is_some() {
            return Ok(ReconcileResult::done());
        }
        let options = SuperDeleteOptions {
            uid: p_pod.metadata.uid.clone(),
            background: false,
        };
        self.executor
            .delete(target_namespace, &request.name, options)
            .await?;
        Ok(ReconcileResult::done())
    }
}

#[async_trait]
impl DwReconciler for PodSyncer {
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
impl UwReconciler for PodSyncer {
    async fn back_populate(&self, key: &str) -> Result<()> {
        let (cluster_key, v_namespace, name) = split_uw_key(key)
            .ok_or_else(|| SyncerError::InvalidKey(key.to_string()))?;
        let target_namespace = conversion::to_super_namespace(&cluster_key, &v_namespace);
        let Some(p_pod) = self.super_store.get(&target_namespace, &name) else {
            return Ok(());
        };
        let Some(v_pod) = self.mc.get(&cluster_key, &v_namespace, &name)? else {
            return Ok(());
        };
        let v_uid = v_pod.metadata.uid.clone().unwrap_or_default();
        if conversion::delegated_uid(&p_pod.metadata) != v_uid {
            return Err(SyncerError::UidMismatch { kind: KIND, name });
        }
        if v_pod.status == p_pod.status {
            return Ok(());
        }
        let cluster = self
            .mc
            .get_cluster(&cluster_key)
            .ok_or_else(|| SyncerError::ClusterNotJoined(cluster_key.clone()))?;
        let mut updated = (*v_pod).clone();
        updated.status = p_pod.status.clone();
        let api = cluster.api_namespaced::<Pod>(&v_namespace)?;
        api.replace_status(
            &name,
            &PostParams::default(),
            serde_json::to_vec(&updated)?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PatrolReconciler for PodSyncer {
    async fn patroller_do(&self) {
        let status_miss = AtomicU64::new(0);

        patrol_pairs(
            KIND,
            &self.mc,
            &self.super_store,
            &self.executor,
            &self.metrics,
            PatrolLabels {
                spec_miss: "SpecMissMatchedPods",
                requeued: "RequeuedTenantPods",
                orphan: "DeletedOrphanSuperMasterPods",
            },
            |cluster_key, owner, p, v| {
                Equality::new(cluster_key, owner)
                    .check_pod_equality(p, v)
                    .is_some()
            },
            |cluster_key, _owner, p, v| {
                if p.status.is_some() && v.status != p.status {
                    status_miss.fetch_add(1, Ordering::Relaxed);
                    let v_namespace = v.metadata.namespace.clone().unwrap_or_default();
                    let name = v.metadata.name.clone().unwrap_or_default();
                    warn!(kind = KIND, namespace = %v_namespace, name = %name,
                        "status differs between super and tenant master");
                    self.uw
                        .add_to_queue(format!("{}/{}/{}", cluster_key, v_namespace, name));
                }
            },
        )
        .await;

        self.metrics
            .set_miss_match("StatusMissMatchedPods", status_miss.load(Ordering::Relaxed));
    }
}

#[async_trait]
impl ResourceSyncer for PodSyncer {
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

fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty())
}
