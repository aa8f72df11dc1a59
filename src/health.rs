//! Probe and metrics endpoints on `:8080`
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller is watching, and `/metrics` exposes the operator's Prometheus
//! registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;

/// Address the probe server listens on
pub const HEALTH_ADDR: &str = "0.0.0.0:8080";

const OPENMETRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Identifies one BookkeeperCluster in metric labels
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// A rollout abort, labelled with the Error condition reason it recorded
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RolloutFaultLabels {
    pub namespace: String,
    pub name: String,
    pub reason: String,
}

/// Operator metrics, all prefixed `bookkeeper_operator_`
pub struct Metrics {
    reconciliations: Family<ClusterLabels, Counter>,
    reconcile_errors: Family<ClusterLabels, Counter>,
    reconcile_duration: Family<ClusterLabels, Histogram>,
    rollout_faults: Family<RolloutFaultLabels, Counter>,
    desired_bookies: Family<ClusterLabels, Gauge>,
    ready_bookies: Family<ClusterLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("bookkeeper_operator");

        let reconciliations = Family::default();
        registry.register("reconciliations", "Reconcile passes that succeeded", reconciliations.clone());

        let reconcile_errors = Family::default();
        registry.register("reconciliation_errors", "Reconcile passes that failed", reconcile_errors.clone());

        let reconcile_duration = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 14))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of successful reconcile passes",
            reconcile_duration.clone(),
        );

        let rollout_faults = Family::default();
        registry.register(
            "rollout_faults",
            "Version rollouts aborted by a faulty bookie",
            rollout_faults.clone(),
        );

        let desired_bookies = Family::default();
        registry.register("cluster_replicas_desired", "Bookies requested in the spec", desired_bookies.clone());

        let ready_bookies = Family::default();
        registry.register("cluster_replicas_ready", "Bookies currently ready", ready_bookies.clone());

        Self {
            reconciliations,
            reconcile_errors,
            reconcile_duration,
            rollout_faults,
            desired_bookies,
            ready_bookies,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration.get_or_create(&labels).observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconcile_errors
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn record_rollout_fault(&self, namespace: &str, name: &str, reason: &str) {
        let labels = RolloutFaultLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: reason.to_string(),
        };
        self.rollout_faults.get_or_create(&labels).inc();
    }

    pub fn set_cluster_replicas(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.desired_bookies.get_or_create(&labels).set(desired);
        self.ready_bookies.get_or_create(&labels).set(ready);
    }

    /// Text exposition of the registry; empty if encoding fails
    pub fn encode(&self) -> String {
        let mut body = String::new();
        match encode(&mut body, &self.registry) {
            Ok(()) => body,
            Err(e) => {
                tracing::error!(error = %e, "metrics encoding failed");
                String::new()
            }
        }
    }
}

/// State shared between the controller and the probe server
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "ok") }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
        state.metrics.encode(),
    )
}

pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    tracing::info!(addr = HEALTH_ADDR, "health server listening");
    axum::serve(listener, create_router(state)).await
}
