//! Prometheus metrics for observability.
//!
//! Server-side metrics cover HTTP traffic and hub sessions. The consumer,
//! delivery and notification metrics live in `assignrelay_core::metrics` and
//! are registered into the same registry.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "assignrelay_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("assignrelay_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

// =============================================================================
// Hub Session Metrics
// =============================================================================

/// Currently connected hub sessions.
pub static HUB_SESSIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "assignrelay_hub_sessions_active",
        "Number of connected hub sessions",
    )
    .unwrap()
});

/// Hub sessions accepted since startup.
pub static HUB_SESSIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "assignrelay_hub_sessions_total",
        "Total hub sessions since startup",
    )
    .unwrap()
});

/// Hub connection attempts refused before upgrade.
pub static HUB_SESSIONS_REFUSED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "assignrelay_hub_sessions_refused_total",
            "Hub connection attempts refused",
        ),
        &["reason"],
    )
    .unwrap()
});

/// Frames written to hub sessions, by event name.
pub static HUB_FRAMES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("assignrelay_hub_frames_sent_total", "Hub frames sent"),
        &["event"],
    )
    .unwrap()
});

/// Number of groups with at least one session (collected dynamically).
pub static HUB_GROUPS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("assignrelay_hub_groups", "Groups with connected sessions").unwrap()
});

/// Orchestrator running flag (collected dynamically).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "assignrelay_orchestrator_running",
        "Whether the assignment orchestrator is running (1) or not (0)",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();

    // Hub
    registry
        .register(Box::new(HUB_SESSIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(HUB_SESSIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HUB_SESSIONS_REFUSED.clone()))
        .unwrap();
    registry
        .register(Box::new(HUB_FRAMES_SENT.clone()))
        .unwrap();
    registry.register(Box::new(HUB_GROUPS.clone())).unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();

    // Core metrics (consumers, deliveries, notifications)
    for metric in assignrelay_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Refresh gauges derived from application state before encoding.
pub async fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let running = state
        .orchestrator()
        .map(|orchestrator| orchestrator.is_running())
        .unwrap_or(false);
    ORCHESTRATOR_RUNNING.set(if running { 1 } else { 0 });
    HUB_GROUPS.set(state.sessions().group_count().await as i64);
}

/// Collapse identifier segments so path labels stay low-cardinality.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if uuid::Uuid::parse_str(segment).is_ok() {
                "{id}"
            } else if !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit()) {
                "{n}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
