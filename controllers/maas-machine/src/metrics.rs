//! Prometheus metrics and probe endpoints.
//!
//! Served on `METRICS_ADDR`:
//! - `GET /healthz` - liveness
//! - `GET /readyz` - ready once the MaasMachine watcher is running
//! - `GET /metrics` - Prometheus exposition format

use crate::error::ControllerError;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

pub struct Metrics {
    registry: Registry,
    /// Passes by result: success, requeue, retryable, terminal
    pub reconcile_total: IntCounterVec,
    /// New instances by provisioning mode
    pub instances_allocated: IntCounterVec,
    pub forced_releases: IntCounter,
    pub reconcile_duration: Histogram,
    ready: AtomicBool,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "maas_machine_reconcile_total",
                "MaasMachine reconciliation passes by result",
            ),
            &["result"],
        )?;
        let instances_allocated = IntCounterVec::new(
            Opts::new(
                "maas_machine_instances_allocated_total",
                "MAAS instances allocated or composed by provisioning mode",
            ),
            &["mode"],
        )?;
        let forced_releases = IntCounter::new(
            "maas_machine_forced_releases_total",
            "Instances force released after breaking or refusing graceful release",
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "maas_machine_reconcile_duration_seconds",
                "Duration of MaasMachine reconciliation passes",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(instances_allocated.clone()))?;
        registry.register(Box::new(forced_releases.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            instances_allocated,
            forced_releases,
            reconcile_duration,
            ready: AtomicBool::new(false),
        })
    }

    pub fn record_reconcile(&self, result: &str) {
        self.reconcile_total.with_label_values(&[result]).inc();
    }

    pub fn record_allocation(&self, mode: &str) {
        self.instances_allocated.with_label_values(&[mode]).inc();
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// GET /healthz
async fn health_check() -> &'static str {
    "OK"
}

/// GET /readyz
async fn readiness_check(State(metrics): State<Arc<Metrics>>) -> Result<&'static str, StatusCode> {
    if metrics.is_ready() {
        Ok("READY")
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// GET /metrics
async fn get_metrics(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(output) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                "failed to encode metrics".to_string(),
            )
        }
    }
}

pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve the probe and metrics endpoints until the listener fails
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::Watch(format!("bind metrics listener {}: {}", addr, e)))?;
    info!("Metrics and probes listening on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server: {}", e)))
}
