//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the syncer ready to serve?)
//! - `/metrics` - Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Labels for per-kind reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl prometheus_client::encoding::EncodeLabelSet for KindLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for patrol checker metrics, e.g. `SpecMissMatchedServices`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CheckerLabels {
    pub check: String,
}

impl prometheus_client::encoding::EncodeLabelSet for CheckerLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("check", self.check.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct SyncerMetrics {
    /// Total downward reconciliations per kind
    pub reconciliations_total: Family<KindLabels, Counter>,
    /// Failed downward reconciliations per kind
    pub reconciliation_errors_total: Family<KindLabels, Counter>,
    /// Reconciliation duration per kind
    pub reconcile_duration_seconds: Family<KindLabels, Histogram>,

    /// Patrol mismatch gauges, reset on every scan
    pub checker_miss_match: Family<CheckerLabels, Gauge>,
    /// Patrol remediation counters
    pub checker_remedy: Family<CheckerLabels, Counter>,

    registry: Registry,
}

impl Default for SyncerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "vc_syncer_reconciliations",
            "Total number of downward reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "vc_syncer_reconciliation_errors",
            "Total number of downward reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds = Family::<KindLabels, Histogram>::new_with_constructor(
            || Histogram::new(exponential_buckets(0.001, 2.0, 15)),
        );
        registry.register(
            "vc_syncer_reconcile_duration_seconds",
            "Duration of downward reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let checker_miss_match = Family::<CheckerLabels, Gauge>::default();
        registry.register(
            "vc_syncer_checker_miss_match",
            "Objects found out of sync by the last patrol scan",
            checker_miss_match.clone(),
        );

        let checker_remedy = Family::<CheckerLabels, Counter>::default();
        registry.register(
            "vc_syncer_checker_remedy",
            "Remediations performed by the patroller",
            checker_remedy.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            checker_miss_match,
            checker_remedy,
            registry,
        }
    }

    pub fn record_reconcile(&self, kind: &str, duration_secs: f64) {
        let labels = KindLabels {
            kind: kind.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, kind: &str) {
        self.reconciliation_errors_total
            .get_or_create(&KindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn set_miss_match(&self, check: &str, value: u64) {
        self.checker_miss_match
            .get_or_create(&CheckerLabels {
                check: check.to_string(),
            })
            .set(value as i64);
    }

    pub fn inc_remedy(&self, check: &str) {
        self.checker_remedy
            .get_or_create(&CheckerLabels {
                check: check.to_string(),
            })
            .inc();
    }

    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Shared health state
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Arc<SyncerMetrics>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Arc::new(SyncerMetrics::new()),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Default bind address for the health server
pub const HEALTH_BIND_ADDR: &str = "0.0.0.0:8080";

/// Run the health server
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = TcpListener::bind(HEALTH_BIND_ADDR).await?;
    tracing::info!("Health server listening on {}", HEALTH_BIND_ADDR);
    axum::serve(listener, app).await
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readiness_toggles() {
        let state = HealthState::new();
        assert!(!state.is_ready().await);
        state.set_ready(true).await;
        assert!(state.is_ready().await);
    }

    #[test]
    fn test_checker_metrics_encode() {
        let metrics = SyncerMetrics::new();
        metrics.set_miss_match("SpecMissMatchedServices", 2);
        metrics.inc_remedy("RequeuedTenantServices");
        let body = metrics.encode().unwrap();
        assert!(body.contains("vc_syncer_checker_miss_match"));
        assert!(body.contains("SpecMissMatchedServices"));
    }
}
