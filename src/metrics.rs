//! Prometheus metrics for the fleet monitor.
//!
//! Initialize once at startup and hand clones to the supervisor:
//! ```ignore
//! let metrics = fleetmon::metrics::init()?;
//! fleetmon::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder, core::Collector,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    monitor_leases: GaugeVec,
    monitors_running: Gauge,
    deltas_received: CounterVec,
    delta_batches_received: CounterVec,
    monitor_errors: CounterVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn inc_monitor_leases(&self, controller: &str) {
        self.monitor_leases.with_label_values(&[controller]).inc();
    }

    pub fn dec_monitor_leases(&self, controller: &str) {
        self.monitor_leases.with_label_values(&[controller]).dec();
    }

    /// Marks a controller monitor as running until the guard is dropped.
    pub fn monitor_running(&self) -> RunningGuard {
        self.monitors_running.inc();
        RunningGuard(self.monitors_running.clone())
    }

    pub fn monitors_running(&self) -> f64 {
        self.monitors_running.get()
    }

    pub fn record_deltas(&self, controller: &str, count: usize) {
        self.deltas_received
            .with_label_values(&[controller])
            .inc_by(count as f64);
        self.delta_batches_received
            .with_label_values(&[controller])
            .inc();
    }

    pub fn record_monitor_error(&self, controller: &str) {
        self.monitor_errors.with_label_values(&[controller]).inc();
    }

    /// Current value of the per-controller lease gauge.
    pub fn monitor_leases(&self, controller: &str) -> f64 {
        self.monitor_leases.with_label_values(&[controller]).get()
    }

    pub fn deltas_received(&self, controller: &str) -> f64 {
        self.deltas_received.with_label_values(&[controller]).get()
    }

    pub fn monitor_errors(&self, controller: &str) -> f64 {
        self.monitor_errors.with_label_values(&[controller]).get()
    }
}

/// Decrements `fleetmon_monitors_running` when dropped.
pub struct RunningGuard(Gauge);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let monitor_leases = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "fleetmon_monitor_leases",
                "Monitor leases currently held by this agent",
            ),
            &["controller"],
        )?,
    );

    let monitors_running = register(
        &registry,
        Gauge::with_opts(Opts::new(
            "fleetmon_monitors_running",
            "Controller monitors currently running in this agent",
        ))?,
    );

    let deltas_received = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "fleetmon_monitor_deltas_received_total",
                "Deltas received from controller watchers",
            ),
            &["controller"],
        )?,
    );

    let delta_batches_received = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "fleetmon_monitor_delta_batches_received_total",
                "Delta batches received from controller watchers",
            ),
            &["controller"],
        )?,
    );

    let monitor_errors = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "fleetmon_monitor_errors_total",
                "Controller API errors",
            ),
            &["controller"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        monitor_leases,
        monitors_running,
        deltas_received,
        delta_batches_received,
        monitor_errors,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Serves `/metrics` on `addr` until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}
