//! Prometheus metrics for kanava
//!
//! Each pipeline registers its own [`Metrics`] on an injected
//! [`Registry`], labelled by subsystem (`ingress`, `loader`), so two
//! pipelines can share one registry and one `/metrics` endpoint.

use crate::error::{KanavaError, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE: &str = "kanava";

/// Why a message left the pipeline without being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Queue was full when the source pushed
    QueueFull,
    /// Payload could not be decoded
    Malformed,
    /// Credential rejected
    AuthFailed,
    /// Still queued when shutdown gave up waiting
    Shutdown,
}

impl DropReason {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::Malformed => "malformed",
            DropReason::AuthFailed => "auth_failed",
            DropReason::Shutdown => "shutdown",
        }
    }

    const ALL: [DropReason; 4] = [
        DropReason::QueueFull,
        DropReason::Malformed,
        DropReason::AuthFailed,
        DropReason::Shutdown,
    ];
}

/// Pipeline metrics for one subsystem
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Intake
    // ─────────────────────────────────────────────────────────────────────────
    /// Messages delivered by the source
    pub received: IntCounter,

    /// Messages dropped (by reason)
    pub dropped: IntCounterVec,

    /// Receipt-to-enqueue latency in seconds
    pub consume_latency: Histogram,

    // ─────────────────────────────────────────────────────────────────────────
    // Authentication
    // ─────────────────────────────────────────────────────────────────────────
    /// Credentials accepted
    pub auth_success: IntCounter,

    /// Credentials rejected
    pub auth_fail: IntCounter,

    /// Public key fetches (initial and refresh)
    pub key_fetches: IntCounter,

    /// Rejection notices published
    pub rejections_sent: IntCounter,

    /// Rejection notices lost (channel full or publish failed)
    pub rejections_dropped: IntCounter,

    // ─────────────────────────────────────────────────────────────────────────
    // Forwarding
    // ─────────────────────────────────────────────────────────────────────────
    /// Payloads handed to the message sink
    pub sent: IntCounter,

    /// Asynchronous delivery failures reported by the sink
    pub send_errors: IntCounter,

    // ─────────────────────────────────────────────────────────────────────────
    // Batching
    // ─────────────────────────────────────────────────────────────────────────
    /// Batches that wrote at least one row
    pub batches_flushed: IntCounter,

    /// Rows the sink reported as written
    pub messages_flushed: IntCounter,

    /// Failed batch writes and rows a store could not accept
    pub flush_errors: IntCounter,

    /// Batch write duration in seconds
    pub flush_duration: Histogram,
}

fn counter(registry: &Registry, subsystem: &str, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem),
    )
    .map_err(|e| KanavaError::Metrics(format!("{name}: {e}")))?;
    registry
        .register(Box::new(c.clone()))
        .map_err(|e| KanavaError::Metrics(format!("{name}: {e}")))?;
    Ok(c)
}

fn histogram(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
) -> Result<Histogram> {
    let h = Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .buckets(buckets),
    )
    .map_err(|e| KanavaError::Metrics(format!("{name}: {e}")))?;
    registry
        .register(Box::new(h.clone()))
        .map_err(|e| KanavaError::Metrics(format!("{name}: {e}")))?;
    Ok(h)
}

impl Metrics {
    /// Create and register metrics for `subsystem`
    ///
    /// Fails if the same subsystem is registered twice on one registry.
    pub fn register(registry: &Registry, subsystem: &str) -> Result<Arc<Self>> {
        let dropped = IntCounterVec::new(
            Opts::new("dropped_total", "Messages dropped without delivery")
                .namespace(NAMESPACE)
                .subsystem(subsystem),
            &["reason"],
        )
        .map_err(|e| KanavaError::Metrics(format!("dropped_total: {e}")))?;
        registry
            .register(Box::new(dropped.clone()))
            .map_err(|e| KanavaError::Metrics(format!("dropped_total: {e}")))?;
        // Pre-create every label so each series is exported from zero
        for reason in DropReason::ALL {
            dropped.with_label_values(&[reason.as_str()]);
        }

        let metrics = Metrics {
            received: counter(registry, subsystem, "received_total", "Messages received")?,
            dropped,
            consume_latency: histogram(
                registry,
                subsystem,
                "consume_latency_seconds",
                "Time from receipt to enqueue",
                // Buckets: 1us to 1s
                vec![0.000001, 0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0],
            )?,

            auth_success: counter(
                registry,
                subsystem,
                "auth_success_total",
                "Credentials accepted",
            )?,
            auth_fail: counter(registry, subsystem, "auth_fail_total", "Credentials rejected")?,
            key_fetches: counter(registry, subsystem, "key_fetches_total", "Public key fetches")?,
            rejections_sent: counter(
                registry,
                subsystem,
                "rejections_sent_total",
                "Rejection notices published",
            )?,
            rejections_dropped: counter(
                registry,
                subsystem,
                "rejections_dropped_total",
                "Rejection notices lost",
            )?,

            sent: counter(registry, subsystem, "sent_total", "Payloads handed to the sink")?,
            send_errors: counter(
                registry,
                subsystem,
                "send_errors_total",
                "Asynchronous sink delivery failures",
            )?,

            batches_flushed: counter(
                registry,
                subsystem,
                "batches_flushed_total",
                "Batches written",
            )?,
            messages_flushed: counter(
                registry,
                subsystem,
                "messages_flushed_total",
                "Items written in batches",
            )?,
            flush_errors: counter(
                registry,
                subsystem,
                "flush_errors_total",
                "Failed batch writes",
            )?,
            flush_duration: histogram(
                registry,
                subsystem,
                "flush_duration_seconds",
                "Time spent writing a batch",
                // Buckets: 100us to 10s
                vec![
                    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0,
                ],
            )?,
        };

        Ok(Arc::new(metrics))
    }

    /// Record one dropped message
    pub fn record_dropped(&self, reason: DropReason) {
        self.record_dropped_n(reason, 1);
    }

    /// Record `count` dropped messages
    pub fn record_dropped_n(&self, reason: DropReason, count: u64) {
        self.dropped.with_label_values(&[reason.as_str()]).inc_by(count);
    }

    /// Current drop count for `reason`
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped.with_label_values(&[reason.as_str()]).get()
    }

    /// Record a successful batch write
    pub fn record_flush(&self, items: usize, duration: Duration) {
        self.batches_flushed.inc();
        self.messages_flushed.inc_by(items as u64);
        self.flush_duration.observe(duration.as_secs_f64());
    }
}

/// Encode everything in `registry` as Prometheus text format
pub fn gather(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
