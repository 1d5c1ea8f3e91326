//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Consumers (deliveries, dispositions, processing time)
//! - Notifications
//! - Startup (roster size, active consumers)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts};

// =============================================================================
// Consumer Metrics
// =============================================================================

/// Deliveries handled, by processing outcome.
pub static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("assignrelay_deliveries_total", "Total deliveries handled"),
        &["outcome"], // "persisted_and_notified", "not_found", "decode_failed", ...
    )
    .unwrap()
});

/// Broker dispositions applied, by kind.
pub static DISPOSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "assignrelay_dispositions_total",
            "Total deliveries settled with the broker",
        ),
        &["disposition"], // "ack", "requeue", "reject"
    )
    .unwrap()
});

/// Deliveries rejected after reaching the attempt cap.
pub static ATTEMPTS_EXHAUSTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "assignrelay_attempts_exhausted_total",
            "Deliveries rejected after max_attempts failed attempts",
        ),
        &["outcome"],
    )
    .unwrap()
});

/// Time from receipt to settlement.
pub static PROCESSING_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "assignrelay_processing_duration_seconds",
            "Duration of delivery processing",
        )
        .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        &["outcome"],
    )
    .unwrap()
});

/// Consumers by state.
pub static CONSUMERS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("assignrelay_consumers", "Worker consumers by state"),
        &["state"],
    )
    .unwrap()
});

// =============================================================================
// Notification Metrics
// =============================================================================

/// Notifications by result.
pub static NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "assignrelay_notifications_total",
            "Total assignment notifications",
        ),
        &["result"], // "sent", "no_sessions", "failed"
    )
    .unwrap()
});

// =============================================================================
// Startup Metrics
// =============================================================================

/// Workers in the roster loaded at startup.
pub static ROSTER_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("assignrelay_roster_size", "Workers in the loaded roster").unwrap()
});

/// Get all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Consumers
        Box::new(DELIVERIES_TOTAL.clone()),
        Box::new(DISPOSITIONS_TOTAL.clone()),
        Box::new(ATTEMPTS_EXHAUSTED.clone()),
        Box::new(PROCESSING_DURATION.clone()),
        Box::new(CONSUMERS.clone()),
        // Notifications
        Box::new(NOTIFICATIONS_TOTAL.clone()),
        // Startup
        Box::new(ROSTER_SIZE.clone()),
    ]
}
