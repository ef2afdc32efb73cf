//! Per-kind equality checks
//!
//! Each check compares a super object (`p*`) with its tenant counterpart
//! (`v*`) and returns the rewritten object iff drift is found; `None` means
//! the pair is convergent. Checks are pure so the reconcilers and the
//! patroller share one source of truth for "equal".
//!
//! The UW-metadata registry is pinned here: the metadata that back-populates
//! to the tenant is every label and annotation on the super object that is
//! not under the syncer's own `tenancy.x-k8s.io` namespace. Everything else
//! is owned by the tenant and flows downward only.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServicePort};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::conversion::{super_annotations, super_labels, OwnerInfo};

/// Prefix of every label/annotation the syncer owns.
const SYNCER_META_PREFIX: &str = "tenancy.x-k8s.io/";

/// Drift checker bound to one tenant cluster.
pub struct Equality<'a> {
    cluster_key: &'a str,
    owner: &'a OwnerInfo,
}

impl<'a> Equality<'a> {
    pub fn new(cluster_key: &'a str, owner: &'a OwnerInfo) -> Self {
        Self { cluster_key, owner }
    }

    /// Compare the downward-synced metadata of a pair. Returns the updated
    /// `(labels, annotations)` for the super object iff drift is found.
    ///
    /// Keys present on the super object but unknown to the expected set are
    /// tolerated: super-side admission webhooks may stamp their own
    /// metadata, and fighting them would make reconciliation divergent.
    /// Keys under the syncer prefix are always enforced.
    pub fn check_dws_meta(
        &self,
        p_meta: &ObjectMeta,
        v_meta: &ObjectMeta,
    ) -> Option<(BTreeMap<String, String>, BTreeMap<String, String>)> {
        let expected_labels = super_labels(self.cluster_key, self.owner, v_meta.labels.as_ref());
        let expected_annotations =
            super_annotations(self.cluster_key, self.owner, v_meta).ok()?;

        let new_labels = merge_expected(p_meta.labels.as_ref(), &expected_labels);
        let new_annotations = merge_expected(p_meta.annotations.as_ref(), &expected_annotations);

        let labels_changed = Some(&new_labels) != p_meta.labels.as_ref();
        let annotations_changed = Some(&new_annotations) != p_meta.annotations.as_ref();
        if labels_changed || annotations_changed {
            Some((new_labels, new_annotations))
        } else {
            None
        }
    }

    /// Compare the metadata that back-populates from super to tenant.
    /// Returns the updated tenant metadata iff drift is found.
    pub fn check_uw_object_meta_equality(
        &self,
        p_meta: &ObjectMeta,
        v_meta: &ObjectMeta,
    ) -> Option<ObjectMeta> {
        let new_labels = upward_view(p_meta.labels.as_ref(), v_meta.labels.as_ref());
        let new_annotations = upward_view(p_meta.annotations.as_ref(), v_meta.annotations.as_ref());

        let changed = new_labels != v_meta.labels.clone().unwrap_or_default()
            || new_annotations != v_meta.annotations.clone().unwrap_or_default();
        if changed {
            let mut updated = v_meta.clone();
            updated.labels = Some(new_labels);
            updated.annotations = Some(new_annotations);
            Some(updated)
        } else {
            None
        }
    }

    /// Pod spec is immutable after admission; the only mutable field the
    /// tenant controls is `activeDeadlineSeconds`. Anything else a
    /// super-side webhook injected (sidecars, volumes) is tolerated drift.
    pub fn check_pod_equality(&self, p_pod: &Pod, v_pod: &Pod) -> Option<Pod> {
        let mut updated: Option<Pod> = None;

        if let Some((labels, annotations)) = self.check_dws_meta(&p_pod.metadata, &v_pod.metadata) {
            let pod = updated.get_or_insert_with(|| p_pod.clone());
            pod.metadata.labels = Some(labels);
            pod.metadata.annotations = Some(annotations);
        }

        let v_deadline = v_pod.spec.as_ref().and_then(|s| s.active_deadline_seconds);
        let p_deadline = p_pod.spec.as_ref().and_then(|s| s.active_deadline_seconds);
        if v_deadline != p_deadline {
            let pod = updated.get_or_insert_with(|| p_pod.clone());
            if let Some(spec) = pod.spec.as_mut() {
                spec.active_deadline_seconds = v_deadline;
            }
        }

        updated
    }

    /// Service spec fields the tenant owns: ports (modulo the node port the
    /// super master assigns), selector, type and session affinity. The
    /// cluster IP belongs to the super master and flows upward.
    pub fn check_service_equality(&self, p_service: &Service, v_service: &Service) -> Option<Service> {
        let mut updated: Option<Service> = None;

        if let Some((labels, annotations)) =
            self.check_dws_meta(&p_service.metadata, &v_service.metadata)
        {
            let service = updated.get_or_insert_with(|| p_service.clone());
            service.metadata.labels = Some(labels);
            service.metadata.annotations = Some(annotations);
        }

        let v_spec = v_service.spec.clone().unwrap_or_default();
        let p_spec = p_service.spec.clone().unwrap_or_default();

        let ports_equal = match (&v_spec.ports, &p_spec.ports) {
            (Some(v_ports), Some(p_ports)) => {
                v_ports.len() == p_ports.len()
                    && v_ports
                        .iter()
                        .zip(p_ports.iter())
                        .all(|(v, p)| comparable_port(v) == comparable_port(p))
            }
            (None, None) => true,
            _ => false,
        };

        if !ports_equal
            || v_spec.selector != p_spec.selector
            || v_spec.type_ != p_spec.type_
            || v_spec.session_affinity != p_spec.session_affinity
        {
            let service = updated.get_or_insert_with(|| p_service.clone());
            let spec = service.spec.get_or_insert_with(Default::default);
            spec.ports = v_spec.ports.clone();
            spec.selector = v_spec.selector.clone();
            spec.type_ = v_spec.type_.clone();
            spec.session_affinity = v_spec.session_affinity.clone();
            // cluster IP stays whatever the super master assigned
            spec.cluster_ip = p_spec.cluster_ip.clone();
            spec.cluster_ips = p_spec.cluster_ips.clone();
        }

        updated
    }

    pub fn check_configmap_equality(
        &self,
        p_configmap: &ConfigMap,
        v_configmap: &ConfigMap,
    ) -> Option<ConfigMap> {
        let mut updated: Option<ConfigMap> = None;

        if let Some((labels, annotations)) =
            self.check_dws_meta(&p_configmap.metadata, &v_configmap.metadata)
        {
            let configmap = updated.get_or_insert_with(|| p_configmap.clone());
            configmap.metadata.labels = Some(labels);
            configmap.metadata.annotations = Some(annotations);
        }

        if p_configmap.data != v_configmap.data || p_configmap.binary_data != v_configmap.binary_data
        {
            let configmap = updated.get_or_insert_with(|| p_configmap.clone());
            configmap.data = v_configmap.data.clone();
            configmap.binary_data = v_configmap.binary_data.clone();
        }

        updated
    }

    /// Secret payload equality. Service-account-token projections are
    /// excluded by the caller: their payload is written by the tenant
    /// control plane and their name is generated.
    pub fn check_secret_equality(&self, p_secret: &Secret, v_secret: &Secret) -> Option<Secret> {
        let mut updated: Option<Secret> = None;

        if let Some((labels, annotations)) =
            self.check_dws_meta(&p_secret.metadata, &v_secret.metadata)
        {
            let secret = updated.get_or_insert_with(|| p_secret.clone());
            secret.metadata.labels = Some(labels);
            secret.metadata.annotations = Some(annotations);
        }

        if p_secret.data != v_secret.data {
            let secret = updated.get_or_insert_with(|| p_secret.clone());
            secret.data = v_secret.data.clone();
        }

        updated
    }

    /// Namespace sync only manages metadata.
    pub fn check_namespace_equality(
        &self,
        p_namespace: &Namespace,
        v_namespace: &Namespace,
    ) -> Option<Namespace> {
        self.check_dws_meta(&p_namespace.metadata, &v_namespace.metadata)
            .map(|(labels, annotations)| {
                let mut updated = p_namespace.clone();
                updated.metadata.labels = Some(labels);
                updated.metadata.annotations = Some(annotations);
                updated
            })
    }
}

/// Desired tenant-side copy of a public super StorageClass. Returns the
/// rewritten tenant object iff it diverges from `v`.
pub fn check_storage_class_equality(
    p_storage_class: &StorageClass,
    v_storage_class: &StorageClass,
) -> Option<StorageClass> {
    let desired = tenant_storage_class(p_storage_class);
    let relevant_equal = desired.provisioner == v_storage_class.provisioner
        && desired.parameters == v_storage_class.parameters
        && desired.reclaim_policy == v_storage_class.reclaim_policy
        && desired.mount_options == v_storage_class.mount_options
        && desired.volume_binding_mode == v_storage_class.volume_binding_mode
        && desired.allow_volume_expansion == v_storage_class.allow_volume_expansion;
    if relevant_equal {
        None
    } else {
        let mut updated = v_storage_class.clone();
        updated.provisioner = desired.provisioner;
        updated.parameters = desired.parameters;
        updated.reclaim_policy = desired.reclaim_policy;
        updated.mount_options = desired.mount_options;
        updated.volume_binding_mode = desired.volume_binding_mode;
        updated.allow_volume_expansion = desired.allow_volume_expansion;
        Some(updated)
    }
}

/// Build the tenant-side copy of a public super StorageClass.
pub fn tenant_storage_class(p_storage_class: &StorageClass) -> StorageClass {
    StorageClass {
        metadata: strip_server_meta(&p_storage_class.metadata),
        provisioner: p_storage_class.provisioner.clone(),
        parameters: p_storage_class.parameters.clone(),
        reclaim_policy: p_storage_class.reclaim_policy.clone(),
        mount_options: p_storage_class.mount_options.clone(),
        volume_binding_mode: p_storage_class.volume_binding_mode.clone(),
        allow_volume_expansion: p_storage_class.allow_volume_expansion,
        allowed_topologies: p_storage_class.allowed_topologies.clone(),
    }
}

/// Desired tenant-side copy of a public super PriorityClass.
pub fn check_priority_class_equality(
    p_priority_class: &PriorityClass,
    v_priority_class: &PriorityClass,
) -> Option<PriorityClass> {
    let desired = tenant_priority_class(p_priority_class);
    let relevant_equal = desired.value == v_priority_class.value
        && desired.global_default == v_priority_class.global_default
        && desired.description == v_priority_class.description
        && desired.preemption_policy == v_priority_class.preemption_policy;
    if relevant_equal {
        None
    } else {
        let mut updated = v_priority_class.clone();
        updated.value = desired.value;
        updated.global_default = desired.global_default;
        updated.description = desired.description;
        updated.preemption_policy = desired.preemption_policy;
        Some(updated)
    }
}

/// Build the tenant-side copy of a public super PriorityClass.
pub fn tenant_priority_class(p_priority_class: &PriorityClass) -> PriorityClass {
    PriorityClass {
        metadata: strip_server_meta(&p_priority_class.metadata),
        value: p_priority_class.value,
        global_default: p_priority_class.global_default,
        description: p_priority_class.description.clone(),
        preemption_policy: p_priority_class.preemption_policy.clone(),
    }
}

fn strip_server_meta(meta: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: meta.name.clone(),
        labels: meta.labels.clone(),
        annotations: meta.annotations.clone(),
        ..Default::default()
    }
}

/// Enforce the expected entries over the super object's current map,
/// pruning stale syncer-owned keys and keeping foreign extras.
fn merge_expected(
    current: Option<&BTreeMap<String, String>>,
    expected: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = current
        .map(|m| {
            m.iter()
                .filter(|(k, _)| !k.starts_with(SYNCER_META_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (k, v) in expected {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// The tenant-visible view of super metadata: everything except the
/// syncer-owned keys, layered over nothing (the super side is authoritative
/// for back-populated metadata).
fn upward_view(
    p_map: Option<&BTreeMap<String, String>>,
    v_map: Option<&BTreeMap<String, String>>,
) -> BTreeMap<String, String> {
    let mut view: BTreeMap<String, String> = p_map
        .map(|m| {
            m.iter()
                .filter(|(k, _)| !k.starts_with(SYNCER_META_PREFIX))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    // Tenant keys the super side never saw stay untouched.
    if let Some(v_map) = v_map {
        for (k, v) in v_map {
            view.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    view
}

fn comparable_port(port: &ServicePort) -> ServicePort {
    ServicePort {
        node_port: None,
        ..port.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn fixture() -> OwnerInfo {
        OwnerInfo {
            name: "test".to_string(),
            namespace: "tenant-1".to_string(),
            uid: "vc-uid".to_string(),
        }
    }

    fn v_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod-1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("12345".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    image: Some("busybox".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    fn paired_super_pod(v: &Pod) -> Pod {
        let owner = fixture();
        let mut p = v.clone();
        p.metadata.namespace = Some("key-default".to_string());
        p.metadata.labels = Some(super_labels("key", &owner, v.metadata.labels.as_ref()));
        p.metadata.annotations =
            Some(super_annotations("key", &owner, &v.metadata).unwrap());
        p
    }

    #[test]
    fn test_equal_pair_yields_none() {
        let owner = fixture();
        let v = v_pod();
        let p = paired_super_pod(&v);
        let equality = Equality::new("key", &owner);
        assert!(equality.check_pod_equality(&p, &v).is_none());
    }

    #[test]
    fn test_webhook_injected_container_is_tolerated() {
        let owner = fixture();
        let v = v_pod();
        let mut p = paired_super_pod(&v);
        p.spec.as_mut().unwrap().containers.push(Container {
            name: "by-webhook".to_string(),
            image: Some("sidecar".to_string()),
            ..Default::default()
        });
        let equality = Equality::new("key", &owner);
        assert!(equality.check_pod_equality(&p, &v).is_none());
    }

    #[test]
    fn test_label_drift_is_flagged_and_rewritten() {
        let owner = fixture();
        let mut v = v_pod();
        v.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("team".to_string(), "platform".to_string());
        let p = paired_super_pod(&v_pod());
        let equality = Equality::new("key", &owner);
        let updated = equality.check_pod_equality(&p, &v).expect("drift expected");
        assert_eq!(
            updated.metadata.labels.unwrap().get("team").map(String::as_str),
            Some("platform")
        );
    }

    #[test]
    fn test_active_deadline_drift_is_flagged() {
        let owner = fixture();
        let mut v = v_pod();
        v.spec.as_mut().unwrap().active_deadline_seconds = Some(120);
        let p = paired_super_pod(&v_pod());
        let equality = Equality::new("key", &owner);
        let updated = equality.check_pod_equality(&p, &v).expect("drift expected");
        assert_eq!(
            updated.spec.unwrap().active_deadline_seconds,
            Some(120)
        );
    }

    #[test]
    fn test_uw_meta_filters_syncer_keys() {
        let owner = fixture();
        let equality = Equality::new("key", &owner);
        let p_meta = ObjectMeta {
            labels: Some(BTreeMap::from([
                ("tenancy.x-k8s.io/cluster".to_string(), "key".to_string()),
                ("lb-ingress".to_string(), "on".to_string()),
            ])),
            ..Default::default()
        };
        let v_meta = ObjectMeta::default();
        let updated = equality
            .check_uw_object_meta_equality(&p_meta, &v_meta)
            .expect("drift expected");
        let labels = updated.labels.unwrap();
        assert_eq!(labels.get("lb-ingress").map(String::as_str), Some("on"));
        assert!(!labels.contains_key("tenancy.x-k8s.io/cluster"));
    }

    #[test]
    fn test_configmap_data_drift() {
        let owner = fixture();
        let equality = Equality::new("key", &owner);
        let v = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("u1".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v2".to_string())])),
            ..Default::default()
        };
        let mut p = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".to_string()),
                namespace: Some("key-default".to_string()),
                labels: Some(super_labels("key", &owner, None)),
                annotations: Some(super_annotations("key", &owner, &v.metadata).unwrap()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("k".to_string(), "v1".to_string())])),
            ..Default::default()
        };
        let updated = equality
            .check_configmap_equality(&p, &v)
            .expect("drift expected");
        assert_eq!(
            updated.data.unwrap().get("k").map(String::as_str),
            Some("v2")
        );
        p.data = v.data.clone();
        assert!(equality.check_configmap_equality(&p, &v).is_none());
    }
}
