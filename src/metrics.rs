//! Prometheus metrics for the ingestion pipeline and the dashboard API.
//!
//! All series are registered once in a process-wide registry. Emission is
//! advisory: losing a sample must never affect ingestion correctness, so the
//! helpers below silently ignore registration/label errors.

use std::sync::LazyLock;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, GaugeVec, Opts, Registry,
    TextEncoder,
};

/// Process-wide registry backing `/metrics`.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let vec = IntCounterVec::new(Opts::new(name, help), labels)
        .expect("metric definitions are static");
    let _ = REGISTRY.register(Box::new(vec.clone()));
    vec
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let vec = GaugeVec::new(Opts::new(name, help), labels).expect("metric definitions are static");
    let _ = REGISTRY.register(Box::new(vec.clone()));
    vec
}

fn histogram_vec(name: &str, help: &str, labels: &[&str], buckets: &[f64]) -> HistogramVec {
    let vec = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.to_vec()),
        labels,
    )
    .expect("metric definitions are static");
    let _ = REGISTRY.register(Box::new(vec.clone()));
    vec
}

/// Messages pulled off an ingress adapter, per MAC.
pub static INGRESS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "subscriber_ingress_total",
        "Messages received from ingress adapters",
        &["mac"],
    )
});

/// Readings committed to storage, per MAC.
pub static COMMIT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "subscriber_commit_total",
        "Readings persisted successfully",
        &["mac"],
    )
});

/// Readings dropped as duplicates, per MAC.
pub static DUPLICATE: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "duplicates_total",
        "Readings skipped because (mac, ts, payload_hash) already existed",
        &["mac"],
    )
});

/// Dead-lettered payloads by failure reason.
pub static DEAD_LETTER: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec("dead_letters_total", "Rejected payloads", &["reason"])
});

/// Adapter reconnects, per MAC.
pub static RECONNECT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "subscriber_reconnects_total",
        "Ingress adapter reconnect events",
        &["mac"],
    )
});

/// Retry failures by MAC and reason.
pub static RETRY: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "subscriber_retries_total",
        "Ingress retry failures",
        &["mac", "reason"],
    )
});

/// Dashboard API requests by endpoint and outcome.
pub static API_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    counter_vec(
        "device_api_requests_total",
        "Device API requests by endpoint and status",
        &["endpoint", "status"],
    )
});

/// Currently active device workers.
pub static ACTIVE_SUBSCRIBERS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("subscriber_active_total", "Active ingestion workers")
        .expect("metric definitions are static");
    let _ = REGISTRY.register(Box::new(gauge.clone()));
    gauge
});

/// Per-MAC ingestion lag in seconds.
pub static LAG_SECONDS: LazyLock<GaugeVec> = LazyLock::new(|| {
    gauge_vec(
        "subscriber_lag_seconds",
        "Seconds of backlog on the ingress side",
        &["mac"],
    )
});

/// Normalize-and-persist latency per envelope.
pub static INGEST_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "ingestion_latency_seconds",
            "Latency from envelope receipt to commit",
        )
        .buckets(vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0]),
    )
    .expect("metric definitions are static");
    let _ = REGISTRY.register(Box::new(histogram.clone()));
    histogram
});

/// Dashboard API latency per endpoint.
pub static API_LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    histogram_vec(
        "device_api_latency_seconds",
        "Device API request duration",
        &["endpoint"],
        &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0],
    )
});

/// Points/items returned per dashboard response.
pub static API_POINTS: LazyLock<HistogramVec> = LazyLock::new(|| {
    histogram_vec(
        "device_api_points",
        "Points or records returned by the device API",
        &["endpoint"],
        &[1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 2000.0, 5000.0],
    )
});

/// Records request count + latency (+ optional point count) for a dashboard
/// endpoint in one call, matching how the API routes instrument themselves.
pub fn observe_device_api(endpoint: &str, status: &str, elapsed_secs: f64, points: Option<usize>) {
    API_REQUESTS.with_label_values(&[endpoint, status]).inc();
    API_LATENCY
        .with_label_values(&[endpoint])
        .observe(elapsed_secs);
    if let Some(points) = points {
        API_POINTS
            .with_label_values(&[endpoint])
            .observe(points as f64);
    }
}

/// Renders the registry in Prometheus text exposition format.
pub fn export() -> (String, &'static str) {
    let encoder = TextEncoder::new();
    let body = encoder
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default();
    (body, "text/plain; version=0.0.4")
}
