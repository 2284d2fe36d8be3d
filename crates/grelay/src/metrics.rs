use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness flag, cleared while the proxy drains on shutdown.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that reports ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the proxy as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the proxy is ready to accept calls.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Routes served by the metrics endpoint, without the `/metrics` exporter.
pub fn health_router(health_state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())))
}

/// Installs the Prometheus recorder and serves `/metrics`, `/health` and
/// `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder is already installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = health_router(health_state).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 while the process is up.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// In-flight call gauges.
pub mod gauges {
    /// Increment the active calls gauge.
    pub fn inc_calls_active() {
        metrics::gauge!("grelay_calls_active").increment(1.0);
    }

    /// Decrement the active calls gauge.
    pub fn dec_calls_active() {
        metrics::gauge!("grelay_calls_active").decrement(1.0);
    }
}

/// Event counters.
pub mod counters {
    /// Record a finished call with the given outcome label.
    pub fn calls_total(outcome: &'static str) {
        metrics::counter!("grelay_calls_total", "outcome" => outcome).increment(1);
    }

    /// Increment the relayed-messages counter for one direction.
    pub fn messages_relayed_total(direction: &'static str) {
        metrics::counter!("grelay_messages_relayed_total", "direction" => direction).increment(1);
    }

    /// Record payload bytes relayed in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("grelay_payload_bytes_total", "direction" => direction).increment(bytes);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record the wall-clock duration of one relayed call in seconds.
    pub fn call_duration_seconds(value: f64) {
        metrics::histogram!("grelay_call_duration_seconds").record(value);
    }
}
