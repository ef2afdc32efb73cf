//! Virtual-cluster multi-tenancy syncer
//!
//! Presents each tenant with what looks like a dedicated control plane
//! while the workloads run on a shared super cluster. The syncer projects
//! tenant objects into per-tenant super namespaces (downward sync),
//! back-propagates observable state (upward sync), and patrols both sides
//! for divergence.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod conversion;
pub mod health;
pub mod resources;
pub mod scheduler;
pub mod syncer;
pub mod webhooks;

pub use cluster::{ClusterState, ObjectStore, Store, TenantCluster};
pub use config::SyncerConfiguration;
pub use health::{run_health_server, HealthState, SyncerMetrics};
pub use syncer::error::{BackoffConfig, Result, SyncerError};
pub use syncer::listener::ClusterChangeBus;
pub use syncer::reconcile::{ReconcileResult, Request};
pub use syncer::{InitContext, ResourceSyncer, ResourceSyncerOptions, SuperStores, SyncerManager};
pub use webhooks::{run_webhook_server, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH};

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

/// Assemble the full syncer: super-store reflectors, every configured
/// per-kind syncer, and the cluster-change bus the tenant provisioner
/// drives. The returned manager blocks in `start` until `stop` fires or a
/// loop fails.
pub fn build_syncer(
    client: Client,
    config: Arc<SyncerConfiguration>,
    metrics: Arc<SyncerMetrics>,
    stop: CancellationToken,
) -> Result<SyncerManager> {
    let context = InitContext {
        config,
        super_client: Some(client),
        stores: SuperStores::new(),
        metrics,
        options: ResourceSyncerOptions::default(),
        stop,
    };
    let bus = ClusterChangeBus::new();
    SyncerManager::from_registrations(&context, &resources::registrations_for(&context), bus)
}
