//! Prometheus metrics for the delivery engines.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** serving
//! requests. The helper functions (`inc_started`, `observe_duration`, …)
//! are no-ops if `init_metrics` was never called, so the server is always
//! safe to run — observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `storyrelay_generations_total` | Counter | `transport` |
//! | `storyrelay_generations_completed_total` | Counter | `transport` |
//! | `storyrelay_generations_failed_total` | Counter | `transport`, `reason` |
//! | `storyrelay_generation_duration_seconds` | Histogram | `transport` |
//! | `storyrelay_active_tasks` | Gauge | — |

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::StoryError;

/// All Prometheus metrics for the service, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Generations started, per transport.
    pub generations_total: CounterVec,
    /// Generations completed successfully, per transport.
    pub generations_completed: CounterVec,
    /// Generations failed, per transport and failure reason.
    pub generations_failed: CounterVec,
    /// End-to-end generation latency histogram, per transport.
    pub generation_duration: HistogramVec,
    /// Polling tasks currently tracked by the task store.
    pub active_tasks: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private
/// registry.
///
/// Must be called once at process startup before serving requests. Calling
/// it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`StoryError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
pub fn init_metrics() -> Result<(), StoryError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let generations_total = CounterVec::new(
        Opts::new("storyrelay_generations_total", "Generations started"),
        &["transport"],
    )
    .map_err(|e| StoryError::Other(format!("metric construction failed: {e}")))?;

    let generations_completed = CounterVec::new(
        Opts::new(
            "storyrelay_generations_completed_total",
            "Generations completed successfully",
        ),
        &["transport"],
    )
    .map_err(|e| StoryError::Other(format!("metric construction failed: {e}")))?;

    let generations_failed = CounterVec::new(
        Opts::new(
            "storyrelay_generations_failed_total",
            "Generations failed, by reason",
        ),
        &["transport", "reason"],
    )
    .map_err(|e| StoryError::Other(format!("metric construction failed: {e}")))?;

    let generation_duration = HistogramVec::new(
        HistogramOpts::new(
            "storyrelay_generation_duration_seconds",
            "End-to-end generation latency",
        ),
        &["transport"],
    )
    .map_err(|e| StoryError::Other(format!("metric construction failed: {e}")))?;

    let active_tasks = IntGauge::new(
        "storyrelay_active_tasks",
        "Polling tasks currently tracked by the task store",
    )
    .map_err(|e| StoryError::Other(format!("metric construction failed: {e}")))?;

    for collector in [
        Box::new(generations_total.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(generations_completed.clone()),
        Box::new(generations_failed.clone()),
        Box::new(generation_duration.clone()),
        Box::new(active_tasks.clone()),
    ] {
        registry
            .register(collector)
            .map_err(|e| StoryError::Other(format!("metric registration failed: {e}")))?;
    }

    let _ = METRICS.set(Metrics {
        registry,
        generations_total,
        generations_completed,
        generations_failed,
        generation_duration,
        active_tasks,
    });

    Ok(())
}

// ── Recording helpers (no-ops when uninitialised) ─────────────────────────

/// Record a generation starting on the given transport.
pub fn inc_started(transport: &str) {
    if let Some(m) = METRICS.get() {
        m.generations_total.with_label_values(&[transport]).inc();
    }
}

/// Record a successful generation on the given transport.
pub fn inc_completed(transport: &str) {
    if let Some(m) = METRICS.get() {
        m.generations_completed
            .with_label_values(&[transport])
            .inc();
    }
}

/// Record a failed generation with a coarse reason label.
pub fn inc_failed(transport: &str, reason: &str) {
    if let Some(m) = METRICS.get() {
        m.generations_failed
            .with_label_values(&[transport, reason])
            .inc();
    }
}

/// Record end-to-end generation latency.
pub fn observe_duration(transport: &str, duration: Duration) {
    if let Some(m) = METRICS.get() {
        m.generation_duration
            .with_label_values(&[transport])
            .observe(duration.as_secs_f64());
    }
}

/// Update the tracked-task gauge.
pub fn set_active_tasks(count: usize) {
    if let Some(m) = METRICS.get() {
        m.active_tasks.set(count as i64);
    }
}

/// Render all registered metrics in Prometheus text format.
///
/// Returns an empty string if metrics were never initialised or encoding
/// fails; the `/metrics` endpoint then serves an empty body rather than an
/// error.
pub fn gather_metrics() -> String {
    let Some(m) = METRICS.get() else {
        return String::new();
    };

    let families = m.registry.gather();
    let mut buffer = Vec::new();
    if TextEncoder::new().encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
