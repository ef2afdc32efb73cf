//! Per-kind resource syncers
//!
//! Each module owns the concrete reconcile logic for one Kubernetes kind,
//! composed over the multi-cluster controller, the upward controller and the
//! patroller. The registration table at the bottom is the declarative list
//! the manager is built from.

pub mod configmap;
pub mod namespace;
pub mod pod;
pub mod priorityclass;
pub mod secret;
pub mod service;
pub mod storageclass;

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::cluster::Store;
use crate::conversion::{self, OwnerInfo};
use crate::health::SyncerMetrics;
use crate::syncer::executor::{SuperDeleteOptions, SuperExecutor};
use crate::syncer::mc::MultiClusterController;
use crate::syncer::{InitContext, Registration};

/// Metric label names used by one kind's patrol scan.
pub(crate) struct PatrolLabels {
    pub spec_miss: &'static str,
    pub requeued: &'static str,
    pub orphan: &'static str,
}

/// Counters accumulated during one patrol scan.
pub(crate) struct PatrolCounters {
    pub spec_miss: AtomicU64,
    pub requeued: AtomicU64,
    pub orphan: AtomicU64,
}

impl PatrolCounters {
    fn new() -> Self {
        Self {
            spec_miss: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            orphan: AtomicU64::new(0),
        }
    }
}

/// Generic patrol walk for a namespaced kind.
///
/// Phase one lists every joined tenant's objects and requeues anything whose
/// super counterpart is missing or drifted; an unreachable tenant cache
/// skips that cluster only. Phase two deletes super objects whose tenant
/// counterpart is gone or UID-mismatched, with a precondition on the super
/// object's own UID. `check_drift` is the kind's spec equality; `on_pair`
/// lets a kind run extra per-pair work (e.g. upward checks).
pub(crate) async fn patrol_pairs<K>(
    kind: &'static str,
    mc: &Arc<MultiClusterController<K>>,
    super_store: &Store<K>,
    executor: &Arc<dyn SuperExecutor<K>>,
    metrics: &Arc<SyncerMetrics>,
    labels: PatrolLabels,
    check_drift: impl Fn(&str, &OwnerInfo, &K, &K) -> bool,
    on_pair: impl Fn(&str, &OwnerInfo, &K, &K),
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let cluster_names = mc.get_cluster_names();
    if cluster_names.is_empty() {
        info!(kind, "no tenant clusters joined, skipping patrol scan");
        return;
    }

    let counters = PatrolCounters::new();

    for cluster_key in &cluster_names {
        let owner = match mc.get_owner_info(cluster_key) {
            Ok(owner) => owner,
            Err(err) => {
                warn!(kind, cluster = %cluster_key, error = %err, "skipping cluster during patrol");
                continue;
            }
        };
        let objects = match mc.list(cluster_key) {
            Ok(objects) => objects,
            Err(err) => {
                warn!(kind, cluster = %cluster_key, error = %err, "cannot list tenant cache, skipping cluster");
                continue;
            }
        };
        for v_object in objects {
            let v_meta = v_object.meta();
            let v_namespace = v_meta.namespace.clone().unwrap_or_default();
            let v_name = v_meta.name.clone().unwrap_or_default();
            let target_namespace = conversion::to_super_namespace(cluster_key, &v_namespace);

            let Some(p_object) = super_store.get(&target_namespace, &v_name) else {
                if mc.requeue_object(cluster_key, &v_object).is_ok() {
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            };

            let v_uid = v_meta.uid.clone().unwrap_or_default();
            if conversion::delegated_uid(p_object.meta()) != v_uid {
                error!(kind, namespace = %target_namespace, name = %v_name,
                    "delegated UID is different from tenant object");
                continue;
            }

            if check_drift(cluster_key, &owner, &p_object, &v_object) {
                counters.spec_miss.fetch_add(1, Ordering::Relaxed);
                warn!(kind, namespace = %v_namespace, name = %v_name, cluster = %cluster_key,
                    "spec differs between super and tenant master");
                if mc.requeue_object(cluster_key, &v_object).is_ok() {
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
            }

            on_pair(cluster_key, &owner, &p_object, &v_object);
        }
    }

    for p_object in super_store.list() {
        let p_meta = p_object.meta();
        let Some((cluster_key, v_namespace)) = conversion::get_virtual_owner(p_meta) else {
            continue;
        };
        let p_namespace = p_meta.namespace.clone().unwrap_or_default();
        let p_name = p_meta.name.clone().unwrap_or_default();

        let should_delete = match mc.get(&cluster_key, &v_namespace, &p_name) {
            Ok(None) => true,
            Ok(Some(v_object)) => {
                let v_uid = v_object.meta().uid.clone().unwrap_or_default();
                let mismatch = conversion::delegated_uid(p_meta) != v_uid;
                if mismatch {
                    warn!(kind, namespace = %p_namespace, name = %p_name,
                        "found super object whose delegated UID is different from tenant object");
                }
                mismatch
            }
            // Tenant cluster unreachable or unjoined: leave the object be.
            Err(_) => false,
        };
        if should_delete {
            let options = SuperDeleteOptions {
                uid: p_meta.uid.clone(),
                background: false,
            };
            match executor.delete(&p_namespace, &p_name, options).await {
                Ok(()) => {
                    counters.orphan.fetch_add(1, Ordering::Relaxed);
                    metrics.inc_remedy(labels.orphan);
                }
                Err(err) => {
                    error!(kind, namespace = %p_namespace, name = %p_name, error = %err,
                        "error deleting orphan super object");
                }
            }
        }
    }

    let requeued = counters.requeued.load(Ordering::Relaxed);
    for _ in 0..requeued {
        metrics.inc_remedy(labels.requeued);
    }
    metrics.set_miss_match(labels.spec_miss, counters.spec_miss.load(Ordering::Relaxed));
    debug!(
        kind,
        spec_miss = counters.spec_miss.load(Ordering::Relaxed),
        requeued,
        orphans = counters.orphan.load(Ordering::Relaxed),
        "patrol scan finished"
    );
}

/// The full set of syncer kinds, in the order the manager starts them.
pub fn default_registrations() -> Vec<Registration> {
    vec![
        Registration {
            id: "namespace",
            disable: false,
            init: namespace::NamespaceSyncer::register,
        },
        Registration {
            id: "pod",
            disable: false,
            init: pod::PodSyncer::register,
        },
        Registration {
            id: "service",
            disable: false,
            init: service::ServiceSyncer::register,
        },
        Registration {
            id: "secret",
            disable: false,
            init: secret::SecretSyncer::register,
        },
        Registration {
            id: "configmap",
            disable: false,
            init: configmap::ConfigMapSyncer::register,
        },
        Registration {
            id: "storageclass",
            disable: false,
            init: storageclass::StorageClassSyncer::register,
        },
        Registration {
            id: "priorityclass",
            disable: false,
            init: priorityclass::PriorityClassSyncer::register,
        },
    ]
}

/// Apply the configured propagation modes: a kind that is not `Propagate`
/// is disabled, which resets its syncer on the next manager build.
pub fn registrations_for(context: &InitContext) -> Vec<Registration> {
    let mut registrations = default_registrations();
    for registration in registrations.iter_mut() {
        let (group, resource) = match registration.id {
            "storageclass" => ("storage.k8s.io", "storageclasses"),
            "priorityclass" => ("scheduling.k8s.io", "priorityclasses"),
            "namespace" => ("", "namespaces"),
            "pod" => ("", "pods"),
            "service" => ("", "services"),
            "secret" => ("", "secrets"),
            "configmap" => ("", "configmaps"),
            _ => continue,
        };
        if !context.config.is_propagated(group, resource) {
            registration.disable = true;
        }
    }
    registrations
}
