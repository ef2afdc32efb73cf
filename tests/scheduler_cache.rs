//! Scheduler cache tests
//!
//! Table-driven coverage of slice accounting: capacity enforcement, atomic
//! rollback, and placement lifecycle.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use vc_syncer::scheduler::quantity::{self, ResourceList};
use vc_syncer::scheduler::{
    Cluster, Namespace, Placement, SchedulerCache, SchedulerError, SchedulerPod, Slice,
};

const DEFAULT_NAMESPACE: &str = "testnamespace";
const DEFAULT_CLUSTER: &str = "testcluster";
const OTHER_CLUSTER: &str = "testcluster1";

fn list(pairs: &[(&str, &str)]) -> ResourceList {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn default_capacity() -> ResourceList {
    list(&[("cpu", "2000m"), ("memory", "4Gi")])
}

fn default_quota_slice() -> ResourceList {
    list(&[("cpu", "500m"), ("memory", "1Gi")])
}

#[test]
fn test_add_namespace() {
    struct Case {
        name: &'static str,
        slices: Vec<Slice>,
        alloc_after: ResourceList,
        succeed: bool,
    }

    let slice = |unit: ResourceList, cluster: &str| Slice::new(DEFAULT_NAMESPACE, unit, cluster);

    let cases = vec![
        Case {
            name: "Succeed to add one slice",
            slices: vec![slice(default_quota_slice(), DEFAULT_CLUSTER)],
            alloc_after: list(&[("cpu", "500m"), ("memory", "1Gi")]),
            succeed: true,
        },
        Case {
            name: "Succeed to add two slices",
            slices: vec![
                slice(default_quota_slice(), DEFAULT_CLUSTER),
                slice(default_quota_slice(), DEFAULT_CLUSTER),
            ],
            alloc_after: list(&[("cpu", "1000m"), ("memory", "2Gi")]),
            succeed: true,
        },
        Case {
            name: "Fail due to exceeding cluster memory capacity",
            slices: vec![slice(list(&[("cpu", "400m"), ("memory", "5Gi")]), DEFAULT_CLUSTER)],
            alloc_after: list(&[("cpu", "0"), ("memory", "0")]),
            succeed: false,
        },
        Case {
            name: "Fail due to exceeding cluster cpu capacity",
            slices: vec![slice(list(&[("cpu", "4000m"), ("memory", "3Gi")]), DEFAULT_CLUSTER)],
            alloc_after: list(&[("cpu", "0"), ("memory", "0")]),
            succeed: false,
        },
        Case {
            name: "Fail to add due to exceeding capacity with multiple slices",
            slices: (0..5)
                .map(|_| slice(default_quota_slice(), DEFAULT_CLUSTER))
                .collect(),
            alloc_after: list(&[("cpu", "0"), ("memory", "0")]),
            succeed: false,
        },
        Case {
            name: "Fail due to wrong cluster name",
            slices: vec![slice(default_quota_slice(), OTHER_CLUSTER)],
            alloc_after: list(&[("cpu", "0"), ("memory", "0")]),
            succeed: false,
        },
        Case {
            name: "Fail due to unknown resource",
            slices: vec![slice(
                list(&[("cpu", "500m"), ("memory", "1Gi"), ("unknown", "1Gi")]),
                DEFAULT_CLUSTER,
            )],
            alloc_after: list(&[("cpu", "0"), ("memory", "0")]),
            succeed: false,
        },
    ];

    for case in cases {
        let mut cluster = Cluster::new(DEFAULT_CLUSTER, None, default_capacity());
        let count = case.slices.len();
        let result = cluster.add_namespace(DEFAULT_NAMESPACE, case.slices);
        if case.succeed {
            assert!(result.is_ok(), "{} should succeed: {:?}", case.name, result);
            assert_eq!(
                cluster.slices_of(DEFAULT_NAMESPACE).unwrap().len(),
                count,
                "{} allocated wrong slice count",
                case.name
            );
        } else {
            assert!(result.is_err(), "{} should fail", case.name);
        }
        assert!(
            quantity::equals(&case.alloc_after, &cluster.alloc()),
            "{}: alloc expected {:?}, got {:?}",
            case.name,
            case.alloc_after,
            cluster.alloc()
        );
    }
}

#[test]
fn test_duplicate_add_namespace_fails_without_mutation() {
    let mut cluster = Cluster::new(DEFAULT_CLUSTER, None, default_capacity());
    let slices = vec![Slice::new(
        DEFAULT_NAMESPACE,
        default_quota_slice(),
        DEFAULT_CLUSTER,
    )];
    let alloc_after = list(&[("cpu", "500m"), ("memory", "1Gi")]);

    cluster
        .add_namespace(DEFAULT_NAMESPACE, slices.clone())
        .expect("first add should succeed");
    assert!(quantity::equals(&cluster.alloc(), &alloc_after));

    let err = cluster
        .add_namespace(DEFAULT_NAMESPACE, slices)
        .expect_err("duplicate add should fail");
    assert!(matches!(err, SchedulerError::DuplicateNamespace(_)));
    assert!(quantity::equals(&cluster.alloc(), &alloc_after));
}

#[test]
fn test_remove_namespace() {
    // Remove returns the allocation to exactly its prior value.
    let mut cluster = Cluster::new(DEFAULT_CLUSTER, None, default_capacity());
    let slices = vec![
        Slice::new(DEFAULT_NAMESPACE, default_quota_slice(), DEFAULT_CLUSTER),
        Slice::new(DEFAULT_NAMESPACE, default_quota_slice(), DEFAULT_CLUSTER),
    ];
    cluster.add_namespace(DEFAULT_NAMESPACE, slices).unwrap();
    cluster.remove_namespace(DEFAULT_NAMESPACE).unwrap();
    assert!(quantity::equals(
        &cluster.alloc(),
        &list(&[("cpu", "0"), ("memory", "0")])
    ));

    // Removing an absent namespace flags cache corruption.
    let err = cluster
        .remove_namespace(DEFAULT_NAMESPACE)
        .expect_err("second remove should fail");
    assert!(matches!(err, SchedulerError::NamespaceNotFound(_)));
}

#[test]
fn test_deep_copy_is_independent() {
    let mut cluster = Cluster::new(
        DEFAULT_CLUSTER,
        Some(BTreeMap::from([("k".to_string(), "v".to_string())])),
        default_capacity(),
    );
    let pod = SchedulerPod::new(
        "tenant",
        DEFAULT_NAMESPACE,
        "pod-1",
        DEFAULT_CLUSTER,
        list(&[("cpu", "1000m"), ("memory", "2Gi")]),
    );
    cluster.add_pod(pod.clone());
    cluster
        .add_namespace(
            DEFAULT_NAMESPACE,
            vec![Slice::new(
                DEFAULT_NAMESPACE,
                default_quota_slice(),
                DEFAULT_CLUSTER,
            )],
        )
        .unwrap();

    let mut clone = cluster.deep_copy();
    assert_eq!(clone.name(), cluster.name());
    assert_eq!(clone.labels(), cluster.labels());
    assert!(quantity::equals(&clone.alloc(), &cluster.alloc()));
    assert_eq!(
        clone.slices_of(DEFAULT_NAMESPACE).unwrap(),
        cluster.slices_of(DEFAULT_NAMESPACE).unwrap()
    );
    assert_eq!(clone.pods().get(&pod.key()), cluster.pods().get(&pod.key()));

    // Mutating the copy must not leak into the original.
    clone.remove_namespace(DEFAULT_NAMESPACE).unwrap();
    assert!(cluster.slices_of(DEFAULT_NAMESPACE).is_some());
}

fn cache_with_clusters(capacities: &[(&str, ResourceList)]) -> SchedulerCache {
    let cache = SchedulerCache::new();
    for (name, capacity) in capacities {
        cache.add_cluster(Cluster::new(name, None, capacity.clone()));
    }
    cache
}

fn namespace(schedule: Vec<Placement>) -> Namespace {
    Namespace::new(
        "tenant",
        DEFAULT_NAMESPACE,
        BTreeMap::new(),
        list(&[("cpu", "2000m"), ("memory", "4Gi")]),
        default_quota_slice(),
        schedule,
    )
}

#[test]
fn test_cache_slice_rollback_on_capacity_violation() {
    // Capacity fits 4 slices; a plan needing 5 on one cluster must fail
    // and leave the allocation untouched.
    let cache = cache_with_clusters(&[(DEFAULT_CLUSTER, default_capacity())]);
    let ns = Namespace::new(
        "tenant",
        DEFAULT_NAMESPACE,
        BTreeMap::new(),
        list(&[("cpu", "2500m"), ("memory", "5Gi")]),
        default_quota_slice(),
        vec![Placement::new(DEFAULT_CLUSTER, 5)],
    );
    assert!(cache.add_namespace(ns).is_err());
    let snapshot = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    assert!(quantity::equals(
        &snapshot.alloc(),
        &list(&[("cpu", "0"), ("memory", "0")])
    ));
}

#[test]
fn test_cache_partial_placement_rolls_back_all_clusters() {
    // First cluster takes 2 slices fine; second cluster cannot hold 2, so
    // the first cluster's placement must be rolled back too.
    let cache = cache_with_clusters(&[
        (DEFAULT_CLUSTER, default_capacity()),
        (OTHER_CLUSTER, list(&[("cpu", "500m"), ("memory", "1Gi")])),
    ]);
    let ns = namespace(vec![
        Placement::new(DEFAULT_CLUSTER, 2),
        Placement::new(OTHER_CLUSTER, 2),
    ]);
    assert!(cache.add_namespace(ns).is_err());
    for name in [DEFAULT_CLUSTER, OTHER_CLUSTER] {
        let snapshot = cache.snapshot_cluster(name).unwrap();
        assert!(
            quantity::equals(&snapshot.alloc(), &list(&[("cpu", "0"), ("memory", "0")])),
            "cluster {} not rolled back",
            name
        );
    }
}

#[test]
fn test_cache_add_remove_roundtrip() {
    let cache = cache_with_clusters(&[(DEFAULT_CLUSTER, default_capacity())]);
    let ns = namespace(vec![Placement::new(DEFAULT_CLUSTER, 4)]);
    let key = ns.key();

    cache.add_namespace(ns).unwrap();
    let allocated = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    assert!(quantity::equals(&allocated.alloc(), &default_capacity()));

    cache.remove_namespace(&key).unwrap();
    let released = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    assert!(quantity::equals(
        &released.alloc(),
        &list(&[("cpu", "0"), ("memory", "0")])
    ));
}

#[test]
fn test_cache_placement_must_cover_total_slices() {
    let cache = cache_with_clusters(&[(DEFAULT_CLUSTER, default_capacity())]);
    // Quota needs 4 slices, plan only covers 3.
    let ns = namespace(vec![Placement::new(DEFAULT_CLUSTER, 3)]);
    let err = cache.add_namespace(ns).unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::PlacementMismatch {
            placed: 3,
            required: 4
        }
    ));
}

#[test]
fn test_cache_reschedule_via_apply_placement() {
    let cache = cache_with_clusters(&[
        (DEFAULT_CLUSTER, default_capacity()),
        (OTHER_CLUSTER, default_capacity()),
    ]);
    let ns = namespace(vec![Placement::new(DEFAULT_CLUSTER, 4)]);
    let key = ns.key();
    cache.add_namespace(ns).unwrap();

    cache
        .apply_placement(
            &key,
            BTreeMap::from([
                (DEFAULT_CLUSTER.to_string(), 2),
                (OTHER_CLUSTER.to_string(), 2),
            ]),
        )
        .unwrap();

    let first = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    let second = cache.snapshot_cluster(OTHER_CLUSTER).unwrap();
    assert!(quantity::equals(
        &first.alloc(),
        &list(&[("cpu", "1000m"), ("memory", "2Gi")])
    ));
    assert!(quantity::equals(
        &second.alloc(),
        &list(&[("cpu", "1000m"), ("memory", "2Gi")])
    ));
}

#[test]
fn test_cache_failed_reschedule_restores_old_placement() {
    let cache = cache_with_clusters(&[
        (DEFAULT_CLUSTER, default_capacity()),
        (OTHER_CLUSTER, list(&[("cpu", "500m"), ("memory", "1Gi")])),
    ]);
    let ns = namespace(vec![Placement::new(DEFAULT_CLUSTER, 4)]);
    let key = ns.key();
    cache.add_namespace(ns).unwrap();

    // The small cluster cannot take 4 slices; the old placement must
    // survive the failed plan.
    let err = cache.apply_placement(&key, BTreeMap::from([(OTHER_CLUSTER.to_string(), 4)]));
    assert!(err.is_err());
    let restored = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    assert!(quantity::equals(&restored.alloc(), &default_capacity()));
}

#[test]
fn test_cache_pod_tracking_does_not_alter_alloc() {
    let cache = cache_with_clusters(&[(DEFAULT_CLUSTER, default_capacity())]);
    let pod = SchedulerPod::new(
        "tenant",
        DEFAULT_NAMESPACE,
        "pod-1",
        DEFAULT_CLUSTER,
        list(&[("cpu", "1000m"), ("memory", "2Gi")]),
    );
    cache.add_pod(pod.clone()).unwrap();
    let snapshot = cache.snapshot_cluster(DEFAULT_CLUSTER).unwrap();
    assert!(quantity::equals(
        &snapshot.alloc(),
        &list(&[("cpu", "0"), ("memory", "0")])
    ));
    assert!(snapshot.pods().contains_key(&pod.key()));
    cache.remove_pod(&pod).unwrap();
}
