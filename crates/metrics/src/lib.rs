//! Metrics and tracing setup for datsync.
//!
//! Provides a global [`SyncMetrics`] singleton backed by the `prometheus`
//! crate, plus an optional lightweight HTTP server for Prometheus scraping.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<SyncMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static SyncMetrics {
    METRICS.get_or_init(SyncMetrics::new)
}

/// All Prometheus metrics for a datsync node.
pub struct SyncMetrics {
    pub registry: Registry,

    // ── Peer talk ──
    pub talks_sent: IntCounterVec,
    pub talk_failures: IntCounterVec,
    pub talk_latency_secs: HistogramVec,

    // ── Recent index ──
    pub recent_heads_appended: IntCounter,

    // ── Download manager ──
    pub batches_assigned: IntCounter,
    pub batches_failed: IntCounter,
    pub records_stored: IntCounter,
    pub records_given_up: IntCounter,
    pub downloads_completed: IntCounter,
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for peer talk latency.
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0];

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts")
}

impl SyncMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let talks_sent = IntCounterVec::new(
            Opts::new("datsync_talks_sent_total", "Requests sent to peers, by kind"),
            &["kind"],
        )
        .expect("talks_sent counter vec");
        let talk_failures = IntCounterVec::new(
            Opts::new(
                "datsync_talk_failures_total",
                "Requests to peers that failed, by kind",
            ),
            &["kind"],
        )
        .expect("talk_failures counter vec");
        let talk_latency_secs = HistogramVec::new(
            HistogramOpts::new("datsync_talk_latency_seconds", "Peer request latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["kind"],
        )
        .expect("talk_latency_secs histogram");

        let recent_heads_appended = counter(
            "datsync_recent_heads_appended_total",
            "New heads added to the recent index",
        );
        let batches_assigned = counter(
            "datsync_batches_assigned_total",
            "Fetch batches assigned to peers",
        );
        let batches_failed = counter("datsync_batches_failed_total", "Fetch batches that failed");
        let records_stored = counter(
            "datsync_records_stored_total",
            "Records fetched from peers and stored",
        );
        let records_given_up = counter(
            "datsync_records_given_up_total",
            "Records abandoned after exhausting retries",
        );
        let downloads_completed = counter(
            "datsync_downloads_completed_total",
            "Datfiles whose download converged",
        );

        registry
            .register(Box::new(talks_sent.clone()))
            .expect("register talks_sent");
        registry
            .register(Box::new(talk_failures.clone()))
            .expect("register talk_failures");
        registry
            .register(Box::new(talk_latency_secs.clone()))
            .expect("register talk_latency_secs");
        for c in [
            &recent_heads_appended,
            &batches_assigned,
            &batches_failed,
            &records_stored,
            &records_given_up,
            &downloads_completed,
        ] {
            registry
                .register(Box::new(c.clone()))
                .expect("register counter");
        }

        Self {
            registry,
            talks_sent,
            talk_failures,
            talk_latency_secs,
            recent_heads_appended,
            batches_assigned,
            batches_failed,
            records_stored,
            records_given_up,
            downloads_completed,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start a talk latency timer. Records elapsed time on drop.
pub fn start_talk_timer(kind: &str) -> prometheus::HistogramTimer {
    metrics()
        .talk_latency_secs
        .with_label_values(&[kind])
        .start_timer()
}

// ────────────────────────── Metrics HTTP server ──────────────────────────

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

async fn metrics_handler(
    _req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let mut resp = Response::new(Full::new(Bytes::from(encode_metrics())));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
    );
    Ok(resp)
}

/// Serve Prometheus metrics on the given address (`GET /metrics`).
///
/// Call from a `tokio::spawn`.
pub async fn serve_metrics(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on http://{}/metrics", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::debug!("metrics connection error: {}", e);
            }
        });
    }
}

// ────────────────────────── Tests ──────────────────────────
