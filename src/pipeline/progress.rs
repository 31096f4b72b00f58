//! Progress reporting for container runs.
//!
//! The batch pipeline reports the cumulative number of processed images of
//! the current container after every finished batch, and at least once per
//! container even when it has no images.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::annotation::ContainerId;

/// Receives cumulative per-container progress.
pub trait ProgressReporter: Send + Sync {
    /// `processed` is the number of images of `container` done so far.
    fn report(&self, container: ContainerId, processed: usize);
}

/// Logs progress through `tracing`.
#[derive(Debug)]
pub struct TracingProgress {
    start: Instant,
    last: Mutex<Option<(ContainerId, usize)>>,
    total: AtomicUsize,
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TracingProgress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last: Mutex::new(None),
            total: AtomicUsize::new(0),
        }
    }

    /// Images processed across all containers.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for TracingProgress {
    fn report(&self, container: ContainerId, processed: usize) {
        let delta = {
            let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
            let delta = match *last {
                Some((id, prev)) if id == container => processed.saturating_sub(prev),
                _ => processed,
            };
            *last = Some((container, processed));
            delta
        };
        let total = self.total.fetch_add(delta, Ordering::Relaxed) + delta;

        let elapsed_secs = self.start.elapsed().as_secs_f64();
        let per_sec = if elapsed_secs > 0.0 {
            total as f64 / elapsed_secs
        } else {
            0.0
        };

        tracing::info!(
            container_id = container,
            processed,
            total,
            "Progress: {} images in container, {} total ({:.1}/s)",
            processed,
            total,
            per_sec
        );
    }
}

/// Keeps every report in memory.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    reports: Mutex<Vec<(ContainerId, usize)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(ContainerId, usize)> {
        self.reports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Last reported count of a container.
    pub fn last_for(&self, container: ContainerId) -> Option<usize> {
        self.reports()
            .into_iter()
            .rev()
            .find(|(id, _)| *id == container)
            .map(|(_, n)| n)
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, container: ContainerId, processed: usize) {
        self.reports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((container, processed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_progress_accumulates_across_containers() {
        let progress = TracingProgress::new();
        progress.report(1, 2);
        progress.report(1, 5);
        progress.report(2, 3);
        assert_eq!(progress.total(), 8);
    }

    #[test]
    fn test_recording_progress() {
        let progress = RecordingProgress::new();
        progress.report(4, 1);
        progress.report(4, 3);
        assert_eq!(progress.last_for(4), Some(3));
        assert_eq!(progress.last_for(5), None);
        assert_eq!(progress.reports().len(), 2);
    }
}
