//! Tenant-to-super object translation
//!
//! Identity mapping and object construction between the tenant master and
//! the super cluster. All functions here are pure: they never talk to an API
//! server, which keeps every rewrite rule unit-testable in isolation.
//!
//! Naming contract: the super namespace for a tenant namespace is
//! `<clusterKey>-<tenantNamespace>`, where the cluster key is a stable,
//! injective function of the tenant CR coordinates. Super-side clients must
//! not collide with this prefix.

pub mod equality;

pub use equality::Equality;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostAlias, Namespace, Pod, Secret, Service,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::constants::{
    KUBERNETES_HOST_ALIASES, KUBERNETES_SERVICE_HOST_ENV, LABEL_CLUSTER, LABEL_NAMESPACE,
    LABEL_OWNER_REFERENCES, LABEL_SECRET_UID, LABEL_UID, LABEL_VC_NAME, LABEL_VC_NAMESPACE,
};
use crate::syncer::error::Result;

/// Coordinates of the tenant CR that owns a cluster, as recorded on every
/// super namespace the syncer creates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

/// Derive the opaque cluster key for a tenant CR. The key is stable for the
/// tenant's lifetime and injective over `(namespace, uid, name)`.
pub fn to_cluster_key(namespace: &str, name: &str, uid: &str) -> String {
    let digest = Sha256::digest(uid.as_bytes());
    let mut hex = String::with_capacity(6);
    for byte in digest.iter().take(3) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("{}-{}-{}", namespace, hex, name)
}

/// Derive the super namespace name for a tenant namespace. Deterministic and
/// injective over `(clusterKey, tenantNamespace)`.
pub fn to_super_namespace(cluster_key: &str, tenant_namespace: &str) -> String {
    format!("{}-{}", cluster_key, tenant_namespace)
}

/// Reverse-map a super object to its virtual owner `(clusterKey, tenantNs)`.
/// Returns `None` for objects the syncer does not manage.
pub fn get_virtual_owner(meta: &ObjectMeta) -> Option<(String, String)> {
    let cluster = meta.labels.as_ref()?.get(LABEL_CLUSTER)?.clone();
    let namespace = meta.annotations.as_ref()?.get(LABEL_NAMESPACE)?.clone();
    if cluster.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((cluster, namespace))
}

/// The delegation UID recorded on a super object, empty if absent.
pub fn delegated_uid(meta: &ObjectMeta) -> &str {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(LABEL_UID))
        .map(String::as_str)
        .unwrap_or("")
}

/// Ownership labels stamped on every managed super object.
pub fn super_labels(
    cluster_key: &str,
    owner: &OwnerInfo,
    tenant_labels: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut labels = tenant_labels.cloned().unwrap_or_default();
    labels.insert(LABEL_CLUSTER.to_string(), cluster_key.to_string());
    labels.insert(LABEL_VC_NAME.to_string(), owner.name.clone());
    labels.insert(LABEL_VC_NAMESPACE.to_string(), owner.namespace.clone());
    labels
}

/// Ownership annotations stamped on every managed super object, including
/// the delegation UID and the serialized tenant owner references.
pub fn super_annotations(
    cluster_key: &str,
    owner: &OwnerInfo,
    v_meta: &ObjectMeta,
) -> Result<BTreeMap<String, String>> {
    let mut annotations = v_meta.annotations.clone().unwrap_or_default();
    let owner_refs = match &v_meta.owner_references {
        Some(refs) if !refs.is_empty() => serde_json::to_string(refs)?,
        _ => "null".to_string(),
    };
    annotations.insert(LABEL_CLUSTER.to_string(), cluster_key.to_string());
    annotations.insert(
        LABEL_NAMESPACE.to_string(),
        v_meta.namespace.clone().unwrap_or_default(),
    );
    annotations.insert(
        LABEL_UID.to_string(),
        v_meta.uid.clone().unwrap_or_default(),
    );
    annotations.insert(LABEL_VC_NAME.to_string(), owner.name.clone());
    annotations.insert(LABEL_VC_NAMESPACE.to_string(), owner.namespace.clone());
    annotations.insert(LABEL_OWNER_REFERENCES.to_string(), owner_refs);
    Ok(annotations)
}

/// Build the metadata of a super object from its tenant counterpart: name is
/// preserved, namespace is rewritten, read-only server fields are dropped,
/// ownership labels and annotations are stamped.
pub fn build_super_meta(
    cluster_key: &str,
    owner: &OwnerInfo,
    target_namespace: &str,
    v_meta: &ObjectMeta,
) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: v_meta.name.clone(),
        namespace: Some(target_namespace.to_string()),
        labels: Some(super_labels(cluster_key, owner, v_meta.labels.as_ref())),
        annotations: Some(super_annotations(cluster_key, owner, v_meta)?),
        ..Default::default()
    })
}

/// Build a super namespace for a tenant namespace, carrying the virtual
/// owner coordinates so super-side objects are reverse-mappable.
pub fn build_super_namespace(
    cluster_key: &str,
    owner: &OwnerInfo,
    v_namespace: &Namespace,
) -> Namespace {
    let target = to_super_namespace(
        cluster_key,
        v_namespace.metadata.name.as_deref().unwrap_or_default(),
    );
    let labels = super_labels(cluster_key, owner, v_namespace.metadata.labels.as_ref());
    let mut annotations = v_namespace.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(LABEL_CLUSTER.to_string(), cluster_key.to_string());
    annotations.insert(
        LABEL_NAMESPACE.to_string(),
        v_namespace.metadata.name.clone().unwrap_or_default(),
    );
    annotations.insert(
        LABEL_UID.to_string(),
        v_namespace.metadata.uid.clone().unwrap_or_default(),
    );
    annotations.insert(LABEL_VC_NAME.to_string(), owner.name.clone());
    annotations.insert(LABEL_VC_NAMESPACE.to_string(), owner.namespace.clone());
    Namespace {
        metadata: ObjectMeta {
            name: Some(target),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build a super pod from a tenant pod.
///
/// Beyond the generic metadata rewrite, the pod spec is mutated so the
/// workload keeps talking to its *tenant* control plane:
/// - service account token automount is disabled;
/// - the tenant SA-token volume is swapped for the super-side projection
///   (`super_token_secret`), including every volume and mount referencing it;
/// - `KUBERNETES_SERVICE_HOST` is pinned on every container;
/// - a host alias maps the `kubernetes[.default[.svc]]` names to the tenant
///   API address.
pub fn build_super_pod(
    cluster_key: &str,
    owner: &OwnerInfo,
    v_pod: &Pod,
    tenant_token_secret: &str,
    super_token_secret: &str,
    api_server_ip: Option<&str>,
) -> Result<Pod> {
    let target_ns = to_super_namespace(
        cluster_key,
        v_pod.metadata.namespace.as_deref().unwrap_or_default(),
    );
    let mut spec = v_pod.spec.clone().unwrap_or_default();

    spec.automount_service_account_token = Some(false);

    if let Some(volumes) = spec.volumes.as_mut() {
        for volume in volumes.iter_mut() {
            if let Some(secret) = volume.secret.as_mut() {
                if secret.secret_name.as_deref() == Some(tenant_token_secret) {
                    secret.secret_name = Some(super_token_secret.to_string());
                }
            }
            if volume.name == tenant_token_secret {
                volume.name = super_token_secret.to_string();
            }
        }
    }

    for container in spec.containers.iter_mut() {
        rewrite_container(container, tenant_token_secret, super_token_secret);
    }
    if let Some(init_containers) = spec.init_containers.as_mut() {
        for container in init_containers.iter_mut() {
            rewrite_container(container, tenant_token_secret, super_token_secret);
        }
    }

    let alias = HostAlias {
        ip: api_server_ip.map(String::from).unwrap_or_default(),
        hostnames: Some(
            KUBERNETES_HOST_ALIASES
                .iter()
                .map(|h| h.to_string())
                .collect(),
        ),
    };
    spec.host_aliases.get_or_insert_with(Vec::new).push(alias);

    Ok(Pod {
        metadata: build_super_meta(cluster_key, owner, &target_ns, &v_pod.metadata)?,
        spec: Some(spec),
        status: None,
    })
}

fn rewrite_container(container: &mut Container, tenant_token_secret: &str, super_token_secret: &str) {
    if let Some(mounts) = container.volume_mounts.as_mut() {
        for mount in mounts.iter_mut() {
            if mount.name == tenant_token_secret {
                mount.name = super_token_secret.to_string();
            }
        }
    }
    let env = container.env.get_or_insert_with(Vec::new);
    env.retain(|e| e.name != KUBERNETES_SERVICE_HOST_ENV);
    env.push(EnvVar {
        name: KUBERNETES_SERVICE_HOST_ENV.to_string(),
        value: Some(KUBERNETES_HOST_ALIASES[0].to_string()),
        value_from: None,
    });
}

/// Build a super service from a tenant service. The cluster IP is left for
/// the super master to assign; the tenant-visible IP is reconciled upward.
pub fn build_super_service(
    cluster_key: &str,
    owner: &OwnerInfo,
    v_service: &Service,
) -> Result<Service> {
    let target_ns = to_super_namespace(
        cluster_key,
        v_service.metadata.namespace.as_deref().unwrap_or_default(),
    );
    let mut spec = v_service.spec.clone().unwrap_or_default();
    spec.cluster_ip = None;
    spec.cluster_ips = None;
    Ok(Service {
        metadata: build_super_meta(cluster_key, owner, &target_ns, &v_service.metadata)?,
        spec: Some(spec),
        status: None,
    })
}

/// Build a super secret from a tenant secret.
///
/// Service-account-token secrets cannot be stored verbatim: the super master
/// would refuse or rewrite them. They are projected as `Opaque` secrets with
/// a generated name, tagged `LABEL_SECRET_UID` so pod syncing can locate the
/// projection by the tenant secret's UID.
pub fn build_super_secret(cluster_key: &str, owner: &OwnerInfo, v_secret: &Secret) -> Result<Secret> {
    let target_ns = to_super_namespace(
        cluster_key,
        v_secret.metadata.namespace.as_deref().unwrap_or_default(),
    );
    let mut metadata = build_super_meta(cluster_key, owner, &target_ns, &v_secret.metadata)?;
    let mut type_ = v_secret.type_.clone();

    if v_secret.type_.as_deref() == Some("kubernetes.io/service-account-token") {
        let v_name = v_secret.metadata.name.clone().unwrap_or_default();
        let prefix = v_name
            .rsplit_once('-')
            .map(|(head, _)| head.to_string())
            .unwrap_or(v_name);
        metadata.name = None;
        metadata.generate_name = Some(format!("{}-", prefix));
        metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(
                LABEL_SECRET_UID.to_string(),
                v_secret.metadata.uid.clone().unwrap_or_default(),
            );
        type_ = Some("Opaque".to_string());
    }

    Ok(Secret {
        metadata,
        data: v_secret.data.clone(),
        string_data: v_secret.string_data.clone(),
        type_,
        immutable: v_secret.immutable,
    })
}
