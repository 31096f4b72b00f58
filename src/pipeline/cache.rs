//! Per-batch cache of decoded annotations.
//!
//! Each batch index owns one single-assignment cell. The first caller of
//! [`AnnotationCache::get_or_load`] runs the loader; concurrent callers
//! wait on the same cell. A failed load is stored too, so a batch is never
//! downloaded twice. A released index stays released: later callers get
//! `None` and never load it again.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::annotation::Annotation;
use crate::error::PipelineError;

/// Decoded annotations of one batch, shared between readers.
pub type CachedBatch = Arc<Vec<Annotation>>;

/// What a cell ends up holding.
pub type CacheEntry = Result<CachedBatch, PipelineError>;

#[derive(Debug, Default)]
struct Cells {
    live: HashMap<usize, Arc<OnceCell<CacheEntry>>>,
    released: HashSet<usize>,
}

/// Batch index to decoded annotations. Scoped to one container's run.
#[derive(Debug, Default)]
pub struct AnnotationCache {
    cells: Mutex<Cells>,
    writes: AtomicUsize,
}

impl AnnotationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, index: usize) -> Option<Arc<OnceCell<CacheEntry>>> {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        if cells.released.contains(&index) {
            return None;
        }
        Some(cells.live.entry(index).or_default().clone())
    }

    /// Returns the batch at `index`, running `load` if no one has yet.
    ///
    /// At most one loader runs per index; others wait for its result.
    /// Returns `None` once the index has been released.
    pub async fn get_or_load<F, Fut>(&self, index: usize, load: F) -> Option<CacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheEntry>,
    {
        let cell = self.cell(index)?;
        let entry = cell
            .get_or_init(|| async {
                let entry = load().await;
                self.writes.fetch_add(1, Ordering::SeqCst);
                entry
            })
            .await
            .clone();
        Some(entry)
    }

    /// The batch at `index` if it has been written and not released.
    #[cfg(test)]
    pub fn get(&self, index: usize) -> Option<CacheEntry> {
        let cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        cells.live.get(&index).and_then(|cell| cell.get().cloned())
    }

    /// Drops the payload of a consumed batch. The index can not be loaded
    /// again afterwards.
    pub fn release(&self, index: usize) {
        let mut cells = self.cells.lock().unwrap_or_else(|p| p.into_inner());
        cells.live.remove(&index);
        cells.released.insert(index);
    }

    /// Number of cells written so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_write_under_concurrent_requesters() {
        let cache = Arc::new(AnnotationCache::new());
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(3, || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Arc::new(vec![Annotation::new(1, Vec::new())]))
                    })
                    .await
            }));
        }
        for handle in handles {
            let batch = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(batch.len(), 1);
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.writes(), 1);
        assert!(cache.get(3).is_some());
    }

    #[tokio::test]
    async fn test_failed_load_is_not_retried() {
        let cache = AnnotationCache::new();
        let first = cache
            .get_or_load(0, || async {
                Err(PipelineError::Unresolved { batch: 0, count: 1 })
            })
            .await
            .unwrap();
        assert!(first.is_err());

        let second = cache
            .get_or_load(0, || async { Ok(Arc::new(Vec::new())) })
            .await
            .unwrap();
        assert!(second.is_err());
        assert_eq!(cache.writes(), 1);
    }

    #[tokio::test]
    async fn test_released_index_is_never_loaded_again() {
        let cache = AnnotationCache::new();
        assert!(cache.get(1).is_none());
        cache
            .get_or_load(1, || async { Ok(Arc::new(Vec::new())) })
            .await
            .unwrap()
            .unwrap();
        assert!(cache.get(1).is_some());

        cache.release(1);
        assert!(cache.get(1).is_none());

        let late = cache
            .get_or_load(1, || async { Ok(Arc::new(Vec::new())) })
            .await;
        assert!(late.is_none());
        assert_eq!(cache.writes(), 1);
    }
}
