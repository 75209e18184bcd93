//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller is watching clusters, and `/metrics` exposes the operator's
//! Prometheus registry: reconcile outcomes per cluster, clusters by phase,
//! component readiness and horizontal-scale data clones still in progress.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

const OPENMETRICS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Identifies one Cluster object
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub cluster: String,
}

impl ClusterLabels {
    fn new(namespace: &str, cluster: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
        }
    }
}

/// A failed reconcile, by error reason
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub namespace: String,
    pub cluster: String,
    pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseLabels {
    pub phase: String,
}

/// Operator metrics registered on a private registry
pub struct Metrics {
    pub reconciles: Family<ClusterLabels, Counter>,
    pub reconcile_failures: Family<FailureLabels, Counter>,
    pub reconcile_seconds: Family<ClusterLabels, Histogram>,
    pub last_success: Family<ClusterLabels, Gauge>,

    pub clusters: Family<PhaseLabels, Gauge>,
    pub components_desired: Family<ClusterLabels, Gauge>,
    pub components_pods_ready: Family<ClusterLabels, Gauge>,
    /// Components held at their current replica count until new replicas have data
    pub scale_out_waiting: Family<ClusterLabels, Gauge>,

    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("dbcluster");

        let reconciles = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciles",
            "Cluster reconciles that applied their mutation graph",
            reconciles.clone(),
        );

        let reconcile_failures = Family::<FailureLabels, Counter>::default();
        registry.register(
            "reconcile_failures",
            "Cluster reconciles that returned an error, by error reason",
            reconcile_failures.clone(),
        );

        // 5ms up to roughly 80s
        let reconcile_seconds = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 15))
        });
        registry.register(
            "reconcile_seconds",
            "Time spent running the transformer pipeline and applying its graph",
            reconcile_seconds.clone(),
        );

        let last_success = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "last_successful_reconcile_timestamp_seconds",
            "Unix time of the last reconcile of a cluster that succeeded",
            last_success.clone(),
        );

        let clusters = Family::<PhaseLabels, Gauge>::default();
        registry.register(
            "clusters",
            "Clusters in the controller cache, by status phase",
            clusters.clone(),
        );

        let components_desired = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "components_desired",
            "Components listed in the resolved cluster spec, shards included",
            components_desired.clone(),
        );

        let components_pods_ready = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "components_pods_ready",
            "Components whose status reports every pod ready",
            components_pods_ready.clone(),
        );

        let scale_out_waiting = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "scale_out_waiting_components",
            "Components whose scale-out waits on a backup, restore or volume claim",
            scale_out_waiting.clone(),
        );

        Self {
            reconciles,
            reconcile_failures,
            reconcile_seconds,
            last_success,
            clusters,
            components_desired,
            components_pods_ready,
            scale_out_waiting,
            registry,
        }
    }

    /// Count a successful reconcile and stamp its completion time
    pub fn record_reconcile(&self, namespace: &str, cluster: &str, elapsed_secs: f64) {
        let labels = ClusterLabels::new(namespace, cluster);
        self.reconciles.get_or_create(&labels).inc();
        self.reconcile_seconds.get_or_create(&labels).observe(elapsed_secs);
        self.last_success
            .get_or_create(&labels)
            .set(chrono::Utc::now().timestamp());
    }

    pub fn record_failure(&self, namespace: &str, cluster: &str, reason: &str) {
        let labels = FailureLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            reason: reason.to_string(),
        };
        self.reconcile_failures.get_or_create(&labels).inc();
    }

    /// Set the cluster count of one phase; called for every phase on each refresh
    pub fn set_clusters_by_phase(&self, phase: &str, count: i64) {
        let labels = PhaseLabels {
            phase: phase.to_string(),
        };
        self.clusters.get_or_create(&labels).set(count);
    }

    pub fn set_component_readiness(&self, namespace: &str, cluster: &str, desired: i64, pods_ready: i64) {
        let labels = ClusterLabels::new(namespace, cluster);
        self.components_desired.get_or_create(&labels).set(desired);
        self.components_pods_ready.get_or_create(&labels).set(pods_ready);
    }

    pub fn set_scale_out_waiting(&self, namespace: &str, cluster: &str, components: i64) {
        self.scale_out_waiting
            .get_or_create(&ClusterLabels::new(namespace, cluster))
            .set(components);
    }

    /// Drop the series of a deleted cluster; failure counts by reason are kept
    pub fn forget_cluster(&self, namespace: &str, cluster: &str) {
        let labels = ClusterLabels::new(namespace, cluster);
        self.reconciles.remove(&labels);
        self.reconcile_seconds.remove(&labels);
        self.last_success.remove(&labels);
        self.components_desired.remove(&labels);
        self.components_pods_ready.remove(&labels);
        self.scale_out_waiting.remove(&labels);
    }

    /// Text exposition of the registry; empty if encoding fails
    fn render(&self) -> String {
        let mut body = String::new();
        match encode(&mut body, &self.registry) {
            Ok(()) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// State shared by the probe handlers and the controller
pub struct HealthState {
    /// Set once the controller is watching clusters, cleared on shutdown
    pub ready: RwLock<bool>,
    pub metrics: Metrics,
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
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 503 until the controller runs; a standby replica waiting on the lease is not ready
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "controller not running").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, OPENMETRICS_TEXT)],
        state.metrics.render(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the probe endpoints on all interfaces
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Health server listening");
    axum::serve(listener, create_router(state)).await
}
