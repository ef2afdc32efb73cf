//! Well-known labels, annotations and coordinates shared by the syncer and
//! the hierarchy adjunct.
//!
//! Every object the syncer manages on the super cluster carries the
//! `LABEL_CLUSTER` label, which makes super-side objects reverse-mappable to
//! their owning tenant without a lookup table.

/// Label (and annotation) identifying the owning tenant cluster key.
pub const LABEL_CLUSTER: &str = "tenancy.x-k8s.io/cluster";

/// Annotation carrying the tenant-side namespace of the object.
pub const LABEL_NAMESPACE: &str = "tenancy.x-k8s.io/namespace";

/// Annotation carrying the delegation UID: the tenant object's UID stamped
/// into the super object. A mismatch means the pair is broken.
pub const LABEL_UID: &str = "tenancy.x-k8s.io/uid";

/// Label carrying the tenant CR name.
pub const LABEL_VC_NAME: &str = "tenancy.x-k8s.io/vcname";

/// Label carrying the tenant CR namespace.
pub const LABEL_VC_NAMESPACE: &str = "tenancy.x-k8s.io/vcnamespace";

/// Annotation carrying the tenant object's serialized owner references, or
/// the literal string `"null"` when the tenant object has none.
pub const LABEL_OWNER_REFERENCES: &str = "tenancy.x-k8s.io/ownerReferences";

/// Label stamped on super-side service-account-token secrets, carrying the
/// UID of the tenant secret they were projected from. Pod syncing resolves
/// the super token secret through this label.
pub const LABEL_SECRET_UID: &str = "tenancy.x-k8s.io/secret.uid";

/// Label on super-cluster cluster-scoped objects (StorageClass,
/// PriorityClass) opting them into upward fan-out to every tenant.
pub const PUBLIC_OBJECT_KEY: &str = "tenancy.x-k8s.io/super.public";

/// Tenant-side label identifying objects propagated by the hierarchical
/// namespace adjunct. Such objects are protected from non-service-account
/// edits.
pub const LABEL_INHERITED_FROM: &str = "hnc.x-k8s.io/inheritedFrom";

/// Namespace on the tenant master where the DNS service lives.
pub const TENANT_DNS_SERVER_NS: &str = "kube-system";

/// Name of the tenant DNS service. A pod can be created downward once either
/// this service or the super `kubernetes` service is ready.
pub const TENANT_DNS_SERVER_SERVICE_NAME: &str = "kube-dns";

/// Name of the default kubernetes service checked for readiness.
pub const KUBERNETES_SERVICE_NAME: &str = "kubernetes";

/// Environment variable injected into every synced container so in-pod
/// clients resolve the API server through the rewritten host alias.
pub const KUBERNETES_SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// Hostnames aliased to the tenant API server address in synced pods.
pub const KUBERNETES_HOST_ALIASES: [&str; 3] =
    ["kubernetes", "kubernetes.default", "kubernetes.default.svc"];
