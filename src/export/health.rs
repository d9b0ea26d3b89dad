use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "taskpulse";

/// Prometheus metrics for the refresh worker.
///
/// All metrics use the "taskpulse" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Refresh cycles by outcome (published, unchanged, failed).
    pub refresh_cycles: CounterVec,
    /// Wall time of a refresh cycle, fetch included.
    pub refresh_duration: Histogram,
    /// Upstream requests by status (success, error).
    pub upstream_requests: CounterVec,
    pub upstream_request_duration: Histogram,
    /// Raw records received from upstream.
    pub records_fetched: Counter,
    /// Records dropped by the preprocessor.
    pub records_skipped: Counter,
    /// Records in the published snapshot.
    pub snapshot_records: Gauge,
    /// Unix time of the last published snapshot.
    pub last_refresh_timestamp: Gauge,
    /// Whether a refresh cycle is running (1=yes, 0=no).
    pub worker_refreshing: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let refresh_cycles = CounterVec::new(
            Opts::new("refresh_cycles_total", "Total refresh cycles by outcome.")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;
        let refresh_duration = Histogram::with_opts(
            HistogramOpts::new(
                "refresh_duration_seconds",
                "Refresh cycle duration in seconds.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let upstream_requests = CounterVec::new(
            Opts::new(
                "upstream_requests_total",
                "Total upstream task requests by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let upstream_request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "upstream_request_duration_seconds",
                "Upstream task request duration in seconds.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let records_fetched = Counter::with_opts(
            Opts::new(
                "records_fetched_total",
                "Total raw task records received from upstream.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_skipped = Counter::with_opts(
            Opts::new(
                "records_skipped_total",
                "Total task records skipped due to derivation errors.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_records = Gauge::with_opts(
            Opts::new(
                "snapshot_records",
                "Number of task records in the published snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let last_refresh_timestamp = Gauge::with_opts(
            Opts::new(
                "last_refresh_timestamp_seconds",
                "Unix time of the last published snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let worker_refreshing = Gauge::with_opts(
            Opts::new(
                "worker_refreshing",
                "Whether a refresh cycle is running (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(refresh_cycles.clone()))?;
        registry.register(Box::new(refresh_duration.clone()))?;
        registry.register(Box::new(upstream_requests.clone()))?;
        registry.register(Box::new(upstream_request_duration.clone()))?;
        registry.register(Box::new(records_fetched.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(snapshot_records.clone()))?;
        registry.register(Box::new(last_refresh_timestamp.clone()))?;
        registry.register(Box::new(worker_refreshing.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            refresh_cycles,
            refresh_duration,
            upstream_requests,
            upstream_request_duration,
            records_fetched,
            records_skipped,
            snapshot_records,
            last_refresh_timestamp,
            worker_refreshing,
        })
    }

    /// Encode all registered metrics in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz and the routes in
    /// `api`. Returns the bound address.
    pub async fn start(&self, api: Router) -> Result<SocketAddr> {
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
            .with_state(app_state)
            .merge(api);

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

        Ok(local_addr)
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

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "encoding metrics");
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
