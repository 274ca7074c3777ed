use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for collector health and observability.
///
/// All metrics use the "connscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total events received from the event source.
    pub events_received: Counter,
    /// Total events outside the global filter, discarded before dispatch.
    pub events_discarded: Counter,
    /// Handler invocation results by handler and result.
    pub handler_results: CounterVec,
    /// Number of connections currently open.
    pub active_connections: Gauge,
    /// Total connection updates pushed to the sensor.
    pub connection_updates_sent: Counter,
    /// Total runtime filtering configurations applied.
    pub runtime_config_updates: Counter,
    /// Total control channel redial cycles after a session ended.
    pub control_reconnects: Counter,
    /// Self-check observation state by component (1=observed).
    pub selfcheck_observed: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total events received from the event source.",
            )
            .namespace("connscope"),
        )?;
        let events_discarded = Counter::with_opts(
            Opts::new(
                "events_discarded_total",
                "Total events outside the global filter, discarded before dispatch.",
            )
            .namespace("connscope"),
        )?;
        let handler_results = CounterVec::new(
            Opts::new(
                "handler_results_total",
                "Handler invocation results by handler and result.",
            )
            .namespace("connscope"),
            &["handler", "result"],
        )?;
        let active_connections = Gauge::with_opts(
            Opts::new(
                "active_connections",
                "Number of connections currently open.",
            )
            .namespace("connscope"),
        )?;
        let connection_updates_sent = Counter::with_opts(
            Opts::new(
                "connection_updates_sent_total",
                "Total connection updates pushed to the sensor.",
            )
            .namespace("connscope"),
        )?;
        let runtime_config_updates = Counter::with_opts(
            Opts::new(
                "runtime_config_updates_total",
                "Total runtime filtering configurations applied.",
            )
            .namespace("connscope"),
        )?;
        let control_reconnects = Counter::with_opts(
            Opts::new(
                "control_reconnects_total",
                "Total control channel redial cycles after a session ended.",
            )
            .namespace("connscope"),
        )?;
        let selfcheck_observed = GaugeVec::new(
            Opts::new(
                "selfcheck_observed",
                "Self-check observation state by component (1=observed).",
            )
            .namespace("connscope"),
            &["component"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_discarded.clone()))?;
        registry.register(Box::new(handler_results.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(connection_updates_sent.clone()))?;
        registry.register(Box::new(runtime_config_updates.clone()))?;
        registry.register(Box::new(control_reconnects.clone()))?;
        registry.register(Box::new(selfcheck_observed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_discarded,
            handler_results,
            active_connections,
            connection_updates_sent,
            runtime_config_updates,
            control_reconnects,
            selfcheck_observed,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_without_conflict() {
        let health = HealthMetrics::new(":0").expect("metrics");

        health.events_received.inc();
        health
            .handler_results
            .with_label_values(&["network", "processed"])
            .inc();
        health.active_connections.set(3.0);
        health
            .selfcheck_observed
            .with_label_values(&["process"])
            .set(1.0);

        let families = health.registry.gather();
        assert!(!families.is_empty());
    }

    #[tokio::test]
    async fn test_server_start_and_stop() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
