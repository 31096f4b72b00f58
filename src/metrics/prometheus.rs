//! Prometheus metrics registration and export.
//!
//! All metrics live in a private registry so that embedding applications
//! keep their own default registry untouched.

use prometheus::{CounterVec, Encoder, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Registry holding every annotation-validator metric.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Objects processed, labeled by validation outcome.
pub static OBJECTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Batches that reached a terminal state, labeled by state.
pub static BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Store calls retried after a transient failure, labeled by operation.
pub static STORE_RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Container processing duration in seconds, labeled by mode.
pub static CONTAINER_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Recording before initialization is a no-op, so libraries and tests can
/// run without calling this.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let objects_total = CounterVec::new(
        Opts::new(
            "annotation_validator_objects_total",
            "Annotated objects processed by outcome",
        ),
        &["outcome"],
    )?;

    let batches_total = CounterVec::new(
        Opts::new(
            "annotation_validator_batches_total",
            "Batches by terminal state",
        ),
        &["state"],
    )?;

    let store_retries_total = CounterVec::new(
        Opts::new(
            "annotation_validator_store_retries_total",
            "Store calls retried after a transient failure",
        ),
        &["operation"],
    )?;

    let container_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "annotation_validator_container_duration_seconds",
            "Time spent migrating one container",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["mode"],
    )?;

    registry.register(Box::new(objects_total.clone()))?;
    registry.register(Box::new(batches_total.clone()))?;
    registry.register(Box::new(store_retries_total.clone()))?;
    registry.register(Box::new(container_duration.clone()))?;

    // Already initialized if any of these fail.
    let _ = REGISTRY.set(registry);
    let _ = OBJECTS_TOTAL.set(objects_total);
    let _ = BATCHES_TOTAL.set(batches_total);
    let _ = STORE_RETRIES_TOTAL.set(store_retries_total);
    let _ = CONTAINER_DURATION.set(container_duration);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
