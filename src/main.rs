use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use vc_syncer::build_syncer;
use vc_syncer::config::SyncerConfiguration;
use vc_syncer::health::{run_health_server, HealthState};
use vc_syncer::webhooks::{
    run_webhook_server, Forest, NamespaceValidator, ObjectValidator, WebhookState,
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH,
};

/// Lease configuration
const LEASE_NAME: &str = "vc-syncer-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Service account the webhooks exempt from hierarchy protection
const SYNCER_SERVICE_ACCOUNT: &str = "system:serviceaccount:vc-manager:vc-syncer";

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("Failed to install rustls crypto provider and no provider is available".into());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vc_syncer=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    info!("Starting vc-syncer");

    // Create the super cluster client
    let client = Client::try_default().await?;
    info!("Connected to super cluster");

    // Get pod identity for leader election
    let pod_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
        warn!("POD_NAMESPACE not set, using 'default'");
        "default".to_string()
    });

    let config = Arc::new(SyncerConfiguration::default());
    let health_state = Arc::new(HealthState::new());
    let stop = CancellationToken::new();

    // Start health server immediately (probes should work even as non-leader)
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Start the admission webhook server if TLS certificates are available.
    // It runs regardless of leadership so admission requests are answered.
    let webhook_handle = if Path::new(WEBHOOK_CERT_PATH).exists()
        && Path::new(WEBHOOK_KEY_PATH).exists()
    {
        info!("TLS certificates found, starting webhook server");
        let excluded: BTreeSet<String> = config.excluded_namespaces.clone();
        let forest = Arc::new(Forest::new());
        let webhook_state = Arc::new(WebhookState {
            client: Some(client.clone()),
            namespace_validator: NamespaceValidator::new(
                Arc::clone(&forest),
                excluded.clone(),
                SYNCER_SERVICE_ACCOUNT,
            ),
            object_validator: ObjectValidator::new(
                Arc::clone(&config),
                excluded,
                SYNCER_SERVICE_ACCOUNT,
            ),
        });
        Some(tokio::spawn(async move {
            if let Err(e) =
                run_webhook_server(webhook_state, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH).await
            {
                error!("Webhook server error: {}", e);
            }
        }))
    } else {
        info!(
            "TLS certificates not found at {} and {}, webhook server disabled",
            WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH
        );
        None
    };

    info!(
        holder_id = %pod_name,
        namespace = %namespace,
        lease_name = LEASE_NAME,
        "Initializing leader election"
    );

    let lease_lock = LeaseLock::new(
        client.clone(),
        &namespace,
        LeaseLockParams {
            holder_id: pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    // Acquire leadership before starting the syncer manager
    info!("Waiting to acquire leadership...");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                break;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    // Lease renewal background task
    let lease_renewal_handle = {
        let lease_lock = LeaseLock::new(
            client.clone(),
            &namespace,
            LeaseLockParams {
                holder_id: pod_name,
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
            },
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
                match lease_lock.try_acquire_or_renew().await {
                    Ok(result) if !result.acquired_lease => {
                        error!("Lost leadership! Shutting down...");
                        std::process::exit(1);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Failed to renew lease: {}. Shutting down...", e);
                        std::process::exit(1);
                    }
                }
            }
        })
    };

    // Only the elected instance instantiates the manager. Tenant clusters
    // join through the manager's cluster-change bus, driven by the external
    // tenant-control-plane provisioner.
    let manager = build_syncer(
        client,
        Arc::clone(&config),
        health_state.metrics.clone(),
        stop.clone(),
    )?;
    info!(syncers = manager.len(), "Starting resource syncers");
    health_state.set_ready(true).await;

    let manager_stop = stop.clone();
    let manager_handle = tokio::spawn(async move { manager.start(manager_stop).await });

    let webhook_future = async {
        if let Some(handle) = webhook_handle {
            if let Err(e) = handle.await {
                error!("Webhook server task panicked: {}", e);
            }
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = manager_handle => {
            match result {
                Ok(Ok(())) => info!("Syncer manager stopped"),
                Ok(Err(e)) => error!("Syncer manager failed: {}", e),
                Err(e) => error!("Syncer manager task panicked: {}", e),
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        _ = webhook_future => {}
        Err(e) = lease_renewal_handle => {
            error!("Lease renewal task panicked: {}", e);
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            health_state.set_ready(false).await;
            info!("Marked syncer as not ready");

            stop.cancel();
            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Syncer stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
