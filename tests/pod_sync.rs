//! Pod downward-sync scenarios
//!
//! Drives the pod syncer's reconcile against prepared tenant and super
//! caches and asserts on the recorded super-cluster actions, mirroring how
//! the controller observes the world in production.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Container, Pod, PodSpec, Secret, SecretVolumeSource, Service, ServiceAccount, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;

use vc_syncer::constants::{
    KUBERNETES_HOST_ALIASES, LABEL_CLUSTER, LABEL_SECRET_UID, LABEL_UID, LABEL_VC_NAME,
    LABEL_VC_NAMESPACE, TENANT_DNS_SERVER_NS, TENANT_DNS_SERVER_SERVICE_NAME,
};
use vc_syncer::conversion;
use vc_syncer::health::SyncerMetrics;
use vc_syncer::resources::pod::PodSyncer;
use vc_syncer::syncer::executor::{RecordingExecutor, SuperAction, SuperExecutor};
use vc_syncer::syncer::reconcile::{DwReconciler, Request};
use vc_syncer::syncer::{ResourceSyncerOptions, SuperStores};
use vc_syncer::{Store, TenantCluster};

const TENANT_TOKEN_SECRET: &str = "default-token-jbrn5";
const SUPER_TOKEN_SECRET: &str = "default-token-12345";

struct Harness {
    syncer: Arc<PodSyncer>,
    cluster: Arc<TenantCluster>,
    executor: Arc<RecordingExecutor<Pod>>,
    super_pods: Store<Pod>,
    super_services: Store<Service>,
    super_secrets: Store<Secret>,
}

impl Harness {
    fn new() -> Self {
        let stores = SuperStores::new();
        let executor = RecordingExecutor::<Pod>::new();
        let syncer = PodSyncer::new(
            stores.pods.clone(),
            stores.services.clone(),
            stores.secrets.clone(),
            Arc::clone(&executor) as Arc<dyn SuperExecutor<Pod>>,
            Arc::new(SyncerMetrics::new()),
            &ResourceSyncerOptions::default(),
        );
        let cluster = TenantCluster::detached(
            "test",
            "tenant-1",
            "7374a172-c35d-45b1-9c8e-bf5c5b614937",
        );
        syncer.mc().watch(Arc::clone(&cluster));
        Self {
            syncer,
            cluster,
            executor,
            super_pods: stores.pods.clone(),
            super_services: stores.services.clone(),
            super_secrets: stores.secrets.clone(),
        }
    }

    fn cluster_key(&self) -> String {
        self.cluster.cluster_key().to_string()
    }

    fn super_namespace(&self, tenant_namespace: &str) -> String {
        conversion::to_super_namespace(self.cluster.cluster_key(), tenant_namespace)
    }

    async fn reconcile(&self, namespace: &str, name: &str, uid: &str) -> vc_syncer::Result<()> {
        let request = Request::new(&self.cluster_key(), namespace, name, uid);
        self.syncer.reconcile(request).await.map(|_| ())
    }

    fn actions(&self) -> Vec<SuperAction<Pod>> {
        self.executor.actions()
    }
}

fn tenant_pod(name: &str, namespace: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            service_account_name: Some("default".to_string()),
            containers: vec![Container {
                image: Some("busybox".to_string()),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: TENANT_TOKEN_SECRET.to_string(),
                        mount_path: "/var/run/secrets/kubernetes.io/serviceaccount".to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "i-want-to-mount".to_string(),
                        mount_path: "/path".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: TENANT_TOKEN_SECRET.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(TENANT_TOKEN_SECRET.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "i-want-to-mount".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(TENANT_TOKEN_SECRET.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

fn tenant_secret(name: &str, namespace: &str, uid: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/service-account-token".to_string()),
        ..Default::default()
    }
}

fn tenant_service_account(name: &str, namespace: &str, uid: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(uid.to_string()),
            ..Default::default()
        },
        secrets: Some(vec![k8s_openapi::api::core::v1::ObjectReference {
            name: Some(TENANT_TOKEN_SECRET.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn super_secret(name: &str, namespace: &str, tenant_uid: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(LABEL_SECRET_UID.to_string(), tenant_uid.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn super_service(name: &str, namespace: &str, cluster_ip: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: (!cluster_ip.is_empty()).then(|| cluster_ip.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// A super pod carrying the full set of ownership markers, as the syncer
/// would have created it.
fn paired_super_pod(harness: &Harness, v_pod: &Pod, delegated_uid: &str) -> Pod {
    let mut p_pod = conversion::build_super_pod(
        harness.cluster.cluster_key(),
        &harness.cluster.owner_info(),
        v_pod,
        TENANT_TOKEN_SECRET,
        SUPER_TOKEN_SECRET,
        None,
    )
    .expect("building super pod");
    p_pod
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LABEL_UID.to_string(), delegated_uid.to_string());
    p_pod.metadata.uid = Some(format!("p-{}", delegated_uid));
    p_pod
}

fn seed_happy_path(harness: &Harness) {
    let super_default = harness.super_namespace("default");
    harness.super_secrets.apply(super_secret(
        SUPER_TOKEN_SECRET,
        &super_default,
        "s12345",
    ));
    harness
        .super_services
        .apply(super_service("kubernetes", &super_default, ""));
    harness
        .cluster
        .store::<Pod>()
        .apply(tenant_pod("pod-1", "default", "12345"));
    harness
        .cluster
        .store::<Secret>()
        .apply(tenant_secret(TENANT_TOKEN_SECRET, "default", "s12345"));
    harness
        .cluster
        .store::<ServiceAccount>()
        .apply(tenant_service_account("default", "default", "12345"));
}

#[tokio::test]
async fn test_pod_create_happy_path() {
    let harness = Harness::new();
    seed_happy_path(&harness);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();

    let actions = harness.actions();
    assert_eq!(actions.len(), 1, "expected exactly one create action");
    let SuperAction::Create { namespace, object } = &actions[0] else {
        panic!("expected a create action, got {:?}", actions[0]);
    };
    assert_eq!(*namespace, harness.super_namespace("default"));
    assert_eq!(
        object.metadata.namespace.as_deref(),
        Some(harness.super_namespace("default").as_str())
    );

    let labels = object.metadata.labels.as_ref().unwrap();
    assert_eq!(
        labels.get(LABEL_CLUSTER).map(String::as_str),
        Some(harness.cluster.cluster_key())
    );
    assert_eq!(labels.get(LABEL_VC_NAME).map(String::as_str), Some("test"));
    assert_eq!(
        labels.get(LABEL_VC_NAMESPACE).map(String::as_str),
        Some("tenant-1")
    );
    assert_eq!(
        object
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(LABEL_UID)
            .map(String::as_str),
        Some("12345")
    );

    let spec = object.spec.as_ref().unwrap();
    assert_eq!(spec.automount_service_account_token, Some(false));

    // SA token volume and every reference to it rewritten to the super
    // projection.
    let volumes = spec.volumes.as_ref().unwrap();
    assert!(volumes.iter().any(|v| v.name == SUPER_TOKEN_SECRET
        && v.secret.as_ref().unwrap().secret_name.as_deref() == Some(SUPER_TOKEN_SECRET)));
    assert!(volumes.iter().any(|v| v.name == "i-want-to-mount"
        && v.secret.as_ref().unwrap().secret_name.as_deref() == Some(SUPER_TOKEN_SECRET)));
    let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
    assert!(mounts.iter().any(|m| m.name == SUPER_TOKEN_SECRET));

    let env = spec.containers[0].env.as_ref().unwrap();
    assert!(env
        .iter()
        .any(|e| e.name == "KUBERNETES_SERVICE_HOST" && e.value.as_deref() == Some("kubernetes")));

    let aliases = spec.host_aliases.as_ref().unwrap();
    assert_eq!(
        aliases[0].hostnames.as_ref().unwrap().as_slice(),
        &KUBERNETES_HOST_ALIASES.map(String::from)
    );
}

#[tokio::test]
async fn test_pod_delete_fires_against_running_super_pod() {
    let harness = Harness::new();
    let v_pod = tenant_pod("pod-1", "default", "12345");
    let p_pod = paired_super_pod(&harness, &v_pod, "12345");
    let p_uid = p_pod.metadata.uid.clone();
    harness.super_pods.apply(p_pod);
    // Tenant side is gone; the super pod must be deleted with a
    // precondition on its own UID.
    harness.reconcile("default", "pod-1", "12345").await.unwrap();

    let actions = harness.actions();
    assert_eq!(actions.len(), 1, "expected exactly one delete action");
    let SuperAction::Delete {
        namespace,
        name,
        options,
    } = &actions[0]
    else {
        panic!("expected a delete action, got {:?}", actions[0]);
    };
    assert_eq!(*namespace, harness.super_namespace("default"));
    assert_eq!(name, "pod-1");
    assert_eq!(options.uid, p_uid);
}

#[tokio::test]
async fn test_terminating_tenant_pod_triggers_delete_of_running_super_pod() {
    let harness = Harness::new();
    let mut v_pod = tenant_pod("pod-1", "default", "12345");
    v_pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    let p_pod = paired_super_pod(&harness, &v_pod, "12345");
    harness.cluster.store::<Pod>().apply(v_pod);
    harness.super_pods.apply(p_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();

    let actions = harness.actions();
    assert_eq!(actions.len(), 1, "expected exactly one delete action");
    assert!(matches!(&actions[0], SuperAction::Delete { name, .. } if name == "pod-1"));
}

#[tokio::test]
async fn test_terminating_pair_needs_no_action() {
    let harness = Harness::new();
    let mut v_pod = tenant_pod("pod-1", "default", "12345");
    v_pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    let mut p_pod = paired_super_pod(&harness, &v_pod, "12345");
    p_pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    harness.cluster.store::<Pod>().apply(v_pod);
    harness.super_pods.apply(p_pod);

    // Both sides already terminating: no second delete may be filed.
    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_pod_delete_when_already_gone() {
    let harness = Harness::new();
    // Neither side has the pod: the delete has already converged.
    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_pod_delete_with_uid_mismatch_is_rejected() {
    let harness = Harness::new();
    let v_pod = tenant_pod("pod-1", "default", "123456");
    harness
        .super_pods
        .apply(paired_super_pod(&harness, &v_pod, "123456"));

    let err = harness
        .reconcile("default", "pod-1", "12345")
        .await
        .expect_err("uid mismatch must surface");
    assert!(err.to_string().contains("delegated UID is different"));
    assert!(harness.actions().is_empty(), "no delete may be issued");
}

#[tokio::test]
async fn test_pod_update_tolerates_webhook_injected_container() {
    let harness = Harness::new();
    let v_pod = tenant_pod("pod-1", "default", "12345");
    let mut p_pod = paired_super_pod(&harness, &v_pod, "12345");
    p_pod.spec.as_mut().unwrap().containers.push(Container {
        name: "by-webhook".to_string(),
        image: Some("sidecar".to_string()),
        ..Default::default()
    });
    harness.cluster.store::<Pod>().apply(v_pod);
    harness.super_pods.apply(p_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty(), "injected container is tolerated drift");
}

#[tokio::test]
async fn test_pod_under_deletion_is_not_created() {
    let harness = Harness::new();
    seed_happy_path(&harness);
    let mut v_pod = tenant_pod("pod-1", "default", "12345");
    v_pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
    harness.cluster.store::<Pod>().apply(v_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_missing_tenant_token_secret_fails() {
    let harness = Harness::new();
    seed_happy_path(&harness);
    harness
        .cluster
        .store::<Secret>()
        .remove("default", TENANT_TOKEN_SECRET);

    let err = harness
        .reconcile("default", "pod-1", "12345")
        .await
        .expect_err("missing tenant token secret must fail");
    assert!(err.to_string().contains("failed to get vSecret"));
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_missing_super_token_secret_fails() {
    let harness = Harness::new();
    seed_happy_path(&harness);
    harness
        .super_secrets
        .remove(&harness.super_namespace("default"), SUPER_TOKEN_SECRET);

    let err = harness
        .reconcile("default", "pod-1", "12345")
        .await
        .expect_err("missing super token secret must fail");
    assert!(err
        .to_string()
        .contains("failed to find sa secret from super master"));
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_no_ready_service_blocks_creation() {
    let harness = Harness::new();
    seed_happy_path(&harness);
    harness
        .super_services
        .remove(&harness.super_namespace("default"), "kubernetes");

    let err = harness
        .reconcile("default", "pod-1", "12345")
        .await
        .expect_err("creation must wait for a ready service");
    assert!(err.to_string().contains("service is not ready"));
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_tenant_dns_service_satisfies_readiness() {
    let harness = Harness::new();
    let super_system = harness.super_namespace(TENANT_DNS_SERVER_NS);
    harness.super_secrets.apply(super_secret(
        SUPER_TOKEN_SECRET,
        &super_system,
        "s12345",
    ));
    harness.super_services.apply(super_service(
        TENANT_DNS_SERVER_SERVICE_NAME,
        &super_system,
        "192.168.0.10",
    ));
    harness
        .cluster
        .store::<Pod>()
        .apply(tenant_pod("pod-1", TENANT_DNS_SERVER_NS, "12345"));
    harness.cluster.store::<Secret>().apply(tenant_secret(
        TENANT_TOKEN_SECRET,
        TENANT_DNS_SERVER_NS,
        "s12345",
    ));
    harness
        .cluster
        .store::<ServiceAccount>()
        .apply(tenant_service_account("default", TENANT_DNS_SERVER_NS, "12345"));

    harness
        .reconcile(TENANT_DNS_SERVER_NS, "pod-1", "12345")
        .await
        .unwrap();
    assert_eq!(harness.actions().len(), 1);
}

#[tokio::test]
async fn test_existing_identical_pod_needs_no_action() {
    let harness = Harness::new();
    let v_pod = tenant_pod("pod-1", "default", "12345");
    harness
        .super_pods
        .apply(paired_super_pod(&harness, &v_pod, "12345"));
    harness.cluster.store::<Pod>().apply(v_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let harness = Harness::new();
    let v_pod = tenant_pod("pod-1", "default", "12345");
    harness
        .super_pods
        .apply(paired_super_pod(&harness, &v_pod, "12345"));
    harness.cluster.store::<Pod>().apply(v_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}

#[tokio::test]
async fn test_prebound_pod_is_not_synced() {
    let harness = Harness::new();
    seed_happy_path(&harness);
    let mut v_pod = tenant_pod("pod-1", "default", "12345");
    v_pod.spec.as_mut().unwrap().node_name = Some("i-xxxx".to_string());
    harness.cluster.store::<Pod>().apply(v_pod);

    harness.reconcile("default", "pod-1", "12345").await.unwrap();
    assert!(harness.actions().is_empty());
}
