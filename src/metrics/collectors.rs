//! Recording helpers used by the pipeline.
//!
//! Every helper is a no-op until [`init_metrics`](super::init_metrics)
//! has run.

use std::time::Duration;

use super::prometheus::{BATCHES_TOTAL, CONTAINER_DURATION, OBJECTS_TOTAL, STORE_RETRIES_TOTAL};
use crate::validation::OutcomeCounts;

/// Record one retry of a store operation.
pub fn record_retry(operation: &str) {
    if let Some(counter) = STORE_RETRIES_TOTAL.get() {
        counter.with_label_values(&[operation]).inc();
    }
}

/// Record the object outcomes of one validated batch.
pub fn record_outcomes(counts: &OutcomeCounts) {
    let Some(counter) = OBJECTS_TOTAL.get() else {
        return;
    };
    let by_outcome = [
        ("valid", counts.valid),
        ("tagged", counts.tagged),
        ("corrected", counts.corrected),
        ("removed", counts.removed),
        ("unresolved", counts.unresolved),
        ("undecodable", counts.undecodable),
    ];
    for (outcome, n) in by_outcome {
        if n > 0 {
            counter.with_label_values(&[outcome]).inc_by(n as f64);
        }
    }
}

/// Record a batch reaching a terminal state (`uploaded` or `failed`).
pub fn record_batch(state: &str) {
    if let Some(counter) = BATCHES_TOTAL.get() {
        counter.with_label_values(&[state]).inc();
    }
}

/// Record how long one container took in the given mode.
pub fn record_container(mode: &str, elapsed: Duration) {
    if let Some(histogram) = CONTAINER_DURATION.get() {
        histogram
            .with_label_values(&[mode])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_is_safe_without_init() {
        // Must not panic whether or not another test initialized metrics.
        record_retry("copy_images");
        record_batch("uploaded");
        record_outcomes(&OutcomeCounts::default());
        record_container("tag", Duration::from_millis(5));
    }
}
