//! Batch pipeline for a single container.
//!
//! Images are listed page by page, copied to the destination container and
//! split into fixed-size batches with monotonic indices. Every batch moves
//! through
//!
//! ```text
//! Pending -> Downloading -> Downloaded -> Validating -> Validated -> Uploading -> Uploaded
//! ```
//!
//! or ends in `Failed`. Downloads and uploads run in two bounded worker
//! pools; validation runs on the calling task, one batch at a time, in
//! batch order. An upload worker starts writing only after its batch is
//! validated. A failed batch is recorded and the run continues; a fatal
//! store error cancels both pools, waits for in-flight work and is then
//! returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotation::{Annotation, ContainerId, ImageId, ObjectId};
use crate::error::{MigrationError, ObjectError, PipelineError};
use crate::metrics;
use crate::store::{with_retry, DestinationStore, RetryPolicy, SourceStore};
use crate::validation::{OutcomeCounts, ValidationStage};

use super::cache::{AnnotationCache, CacheEntry};
use super::config::MigrationConfig;
use super::coordinator::{BatchSignal, UploadCoordinator};
use super::progress::ProgressReporter;
use super::run::PipelineRun;

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Downloading,
    Downloaded,
    Validating,
    Validated,
    Uploading,
    Uploaded,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Uploaded | BatchState::Failed)
    }

    fn successor(&self) -> Option<BatchState> {
        match self {
            BatchState::Pending => Some(BatchState::Downloading),
            BatchState::Downloading => Some(BatchState::Downloaded),
            BatchState::Downloaded => Some(BatchState::Validating),
            BatchState::Validating => Some(BatchState::Validated),
            BatchState::Validated => Some(BatchState::Uploading),
            BatchState::Uploading => Some(BatchState::Uploaded),
            BatchState::Uploaded | BatchState::Failed => None,
        }
    }

    /// `Failed` is reachable from any non-terminal state; everything else
    /// only from its predecessor.
    pub fn can_advance_to(&self, next: BatchState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == BatchState::Failed || self.successor() == Some(next)
    }
}

/// Current state of every batch of a container run.
#[derive(Debug, Default)]
pub struct BatchTracker {
    states: Mutex<HashMap<usize, BatchState>>,
}

impl BatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, batch: usize) {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(batch, BatchState::Pending);
    }

    /// Moves a batch to `next`. Illegal transitions are refused.
    pub fn advance(&self, batch: usize, next: BatchState) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let Some(current) = states.get_mut(&batch) else {
            return false;
        };
        if !current.can_advance_to(next) {
            warn!(batch, from = ?current, to = ?next, "Refused batch state transition");
            return false;
        }
        *current = next;
        true
    }

    #[cfg(test)]
    pub fn state(&self, batch: usize) -> Option<BatchState> {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&batch)
            .copied()
    }

    /// Number of batches currently in `state`.
    pub fn count(&self, state: BatchState) -> usize {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|s| **s == state)
            .count()
    }
}

/// An object left out of the uploaded result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnresolvedObject {
    pub object_id: Option<ObjectId>,
    pub image_id: Option<ImageId>,
    pub kind: Option<String>,
    pub container_id: Option<ContainerId>,
    pub reason: String,
}

impl From<&ObjectError> for UnresolvedObject {
    fn from(err: &ObjectError) -> Self {
        let reason = err.to_string();
        match err {
            ObjectError::Uncorrectable {
                object_id,
                kind,
                container_id,
            } => Self {
                object_id: Some(*object_id),
                image_id: None,
                kind: Some(kind.to_string()),
                container_id: Some(*container_id),
                reason,
            },
            ObjectError::MissingObjectId {
                image_id,
                container_id,
                ..
            } => Self {
                object_id: None,
                image_id: Some(*image_id),
                kind: None,
                container_id: Some(*container_id),
                reason,
            },
            ObjectError::MixedBatchResult => Self {
                object_id: None,
                image_id: None,
                kind: None,
                container_id: None,
                reason,
            },
        }
    }
}

/// Why a batch failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub batch: usize,
    pub class: String,
    pub error: String,
}

impl From<&PipelineError> for BatchFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            batch: err.batch(),
            class: err.class().to_string(),
            error: err.to_string(),
        }
    }
}

/// Summary of one container run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerReport {
    pub source_container: ContainerId,
    pub destination_container: ContainerId,
    pub name: String,
    pub images: usize,
    pub batches: usize,
    pub batches_uploaded: usize,
    pub batches_failed: usize,
    pub outcomes: OutcomeCounts,
    pub unresolved: Vec<UnresolvedObject>,
    pub failures: Vec<BatchFailure>,
}

impl ContainerReport {
    fn new(run: &PipelineRun) -> Self {
        Self {
            source_container: run.source_container,
            destination_container: run.destination_container,
            name: run.container_name.clone(),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.batches_failed == 0
    }
}

/// Terminal result of one upload worker.
#[derive(Debug)]
struct BatchOutcome {
    batch: usize,
    images: usize,
    result: Result<(), PipelineError>,
}

/// State shared by the workers of one container run.
struct BatchContext {
    destination: Arc<dyn DestinationStore>,
    container: ContainerId,
    retry: RetryPolicy,
    cache: AnnotationCache,
    tracker: BatchTracker,
    download_permits: Semaphore,
    upload_permits: Semaphore,
    cancel: CancellationToken,
}

impl BatchContext {
    /// Returns the decoded batch, downloading it if no one has yet.
    /// `None` once the batch has been validated and released.
    async fn load(&self, batch: usize, images: &[ImageId]) -> Option<CacheEntry> {
        self.cache
            .get_or_load(batch, || self.download(batch, images))
            .await
    }

    async fn download(&self, batch: usize, images: &[ImageId]) -> CacheEntry {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled { batch }),
            permit = self.download_permits.acquire() => {
                permit.map_err(|_| PipelineError::Cancelled { batch })?
            }
        };
        self.tracker.advance(batch, BatchState::Downloading);

        let raw = with_retry(&self.retry, "download_annotations", || {
            self.destination.download_annotations(self.container, images)
        })
        .await
        .map_err(|source| PipelineError::Store {
            batch,
            operation: "download_annotations",
            source,
        })?;

        let annotations = raw
            .iter()
            .map(|r| {
                Annotation::decode(r).map_err(|e| PipelineError::Decode {
                    batch,
                    image_id: r.image_id,
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.tracker.advance(batch, BatchState::Downloaded);
        debug!(batch, images = annotations.len(), "Downloaded batch");
        Ok(Arc::new(annotations))
    }

    /// Waits for the batch signal, then writes the result.
    async fn upload(
        &self,
        coordinator: &UploadCoordinator,
        batch: usize,
        signal: oneshot::Receiver<BatchSignal>,
    ) -> Result<(), PipelineError> {
        let signal = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled { batch }),
            signal = signal => signal.map_err(|_| PipelineError::Cancelled { batch })?,
        };
        let result = match signal {
            BatchSignal::Validated(result) => result,
            BatchSignal::Failed(err) => return Err(err),
        };

        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled { batch }),
            permit = self.upload_permits.acquire() => {
                permit.map_err(|_| PipelineError::Cancelled { batch })?
            }
        };
        self.tracker.advance(batch, BatchState::Uploading);

        let variant = result.variant_name();
        let items = result.len();
        coordinator.dispatch(batch, self.container, result).await?;

        self.tracker.advance(batch, BatchState::Uploaded);
        debug!(batch, variant, items, "Uploaded batch");
        Ok(())
    }
}

/// Worker pools of a container run.
struct Pools {
    downloads: JoinSet<()>,
    uploads: JoinSet<BatchOutcome>,
}

impl Pools {
    /// Waits for every worker after cancellation. Results are discarded.
    async fn drain(&mut self) {
        while self.downloads.join_next().await.is_some() {}
        while self.uploads.join_next().await.is_some() {}
    }
}

/// Progress of the running container.
struct ProgressState {
    processed: usize,
    reported: bool,
}

/// Runs the batch state machine for one container at a time.
pub struct BatchPipeline {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    stage: ValidationStage,
    config: MigrationConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl BatchPipeline {
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        stage: ValidationStage,
        config: MigrationConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            source,
            destination,
            stage,
            config,
            progress,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Migrates one container: copy, validate and upload every batch.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrationError`] for fatal store errors and failures that
    /// prevent the container from being processed at all (listing, copying).
    /// Failed batches are reported in the [`ContainerReport`] instead.
    pub async fn run(
        &self,
        run: &PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<ContainerReport, MigrationError> {
        let started = Instant::now();
        info!(
            source = run.source_container,
            destination = run.destination_container,
            container = %run.container_name,
            mode = %run.mode,
            "Processing container"
        );

        let ctx = Arc::new(BatchContext {
            destination: Arc::clone(&self.destination),
            container: run.destination_container,
            retry: self.config.retry.clone(),
            cache: AnnotationCache::new(),
            tracker: BatchTracker::new(),
            download_permits: Semaphore::new(self.config.download_workers),
            upload_permits: Semaphore::new(self.config.upload_workers),
            cancel: cancel.child_token(),
        });
        let coordinator = Arc::new(UploadCoordinator::new(
            Arc::clone(&self.destination),
            self.config.retry.clone(),
        ));
        let mut pools = Pools {
            downloads: JoinSet::new(),
            uploads: JoinSet::new(),
        };
        let mut report = ContainerReport::new(run);
        let mut progress = ProgressState {
            processed: 0,
            reported: false,
        };

        let mut outcome = self
            .drive(run, &ctx, &coordinator, &mut pools, &mut report, &mut progress)
            .await;

        while outcome.is_ok() {
            let Some(joined) = pools.uploads.join_next().await else {
                break;
            };
            outcome = self.finish_batch(run, &ctx, joined, &mut report, &mut progress);
        }

        if let Err(err) = outcome {
            warn!(
                container = %run.container_name,
                error = %err,
                class = %err.class(),
                "Aborting container run"
            );
            ctx.cancel.cancel();
            pools.drain().await;
            return Err(err);
        }
        while pools.downloads.join_next().await.is_some() {}

        if !progress.reported {
            self.progress.report(run.source_container, progress.processed);
        }
        metrics::record_container(run.mode.name(), started.elapsed());
        info!(
            container = %run.container_name,
            images = report.images,
            batches = report.batches,
            uploaded = ctx.tracker.count(BatchState::Uploaded),
            failed = ctx.tracker.count(BatchState::Failed),
            downloaded = ctx.cache.writes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Container done"
        );
        Ok(report)
    }

    /// Lists, copies and schedules every batch, validating them in order.
    async fn drive(
        &self,
        run: &PipelineRun,
        ctx: &Arc<BatchContext>,
        coordinator: &Arc<UploadCoordinator>,
        pools: &mut Pools,
        report: &mut ContainerReport,
        progress: &mut ProgressState,
    ) -> Result<(), MigrationError> {
        let mut pages = self
            .source
            .list_images_paged(run.source_container, self.config.page_size);
        let mut next_batch = 0usize;

        loop {
            let page = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(MigrationError::Cancelled),
                page = pages.next() => page,
            };
            let Some(page) = page else {
                break;
            };
            let page = page.map_err(MigrationError::from_store)?;
            if page.is_empty() {
                continue;
            }

            let copied = with_retry(&self.config.retry, "copy_or_link_images", || {
                self.destination.copy_or_link_images(
                    run.source_container,
                    &page,
                    run.destination_container,
                )
            })
            .await
            .map_err(MigrationError::from_store)?;
            report.images += copied.len();
            debug!(
                container = %run.container_name,
                images = copied.len(),
                "Copied page to destination"
            );

            let mut scheduled = Vec::new();
            for chunk in copied.chunks(self.config.batch_size.max(1)) {
                let batch = next_batch;
                next_batch += 1;
                let images: Arc<[ImageId]> = chunk.iter().map(|image| image.id).collect();

                ctx.tracker.insert(batch);
                report.batches += 1;

                let worker_ctx = Arc::clone(ctx);
                let worker_images = Arc::clone(&images);
                pools.downloads.spawn(async move {
                    // Errors reach the validation loop through the same cell.
                    let _ = worker_ctx.load(batch, &worker_images).await;
                });

                let signal = coordinator.register(batch);
                let worker_ctx = Arc::clone(ctx);
                let worker_coordinator = Arc::clone(coordinator);
                let count = images.len();
                pools.uploads.spawn(async move {
                    let result = worker_ctx
                        .upload(&worker_coordinator, batch, signal)
                        .await;
                    BatchOutcome {
                        batch,
                        images: count,
                        result,
                    }
                });

                scheduled.push((batch, images));
            }

            for (batch, images) in scheduled {
                self.validate(run, ctx, coordinator, batch, &images, report)
                    .await?;

                while let Some(joined) = pools.uploads.try_join_next() {
                    self.finish_batch(run, ctx, joined, report, progress)?;
                }
                while pools.downloads.try_join_next().is_some() {}
            }
        }

        Ok(())
    }

    /// Validates one batch and publishes its signal.
    async fn validate(
        &self,
        run: &PipelineRun,
        ctx: &BatchContext,
        coordinator: &UploadCoordinator,
        batch: usize,
        images: &[ImageId],
        report: &mut ContainerReport,
    ) -> Result<(), MigrationError> {
        let entry = ctx
            .load(batch, images)
            .await
            .ok_or(PipelineError::DuplicateResult { batch })?;
        ctx.cache.release(batch);

        let signal = match entry {
            Ok(annotations) => {
                ctx.tracker.advance(batch, BatchState::Validating);
                match self.stage.validate_batch(run, &annotations) {
                    Ok(validation) => {
                        record_counts(report, &validation.counts, &validation.unresolved);
                        ctx.tracker.advance(batch, BatchState::Validated);
                        debug!(
                            batch,
                            variant = validation.result.variant_name(),
                            items = validation.result.len(),
                            "Validated batch"
                        );
                        BatchSignal::Validated(validation.result)
                    }
                    Err(rejection) => {
                        record_counts(report, &rejection.counts, &rejection.unresolved);
                        let err = match rejection
                            .unresolved
                            .iter()
                            .find(|e| matches!(e, ObjectError::MixedBatchResult))
                        {
                            Some(mixed) => PipelineError::Object {
                                batch,
                                source: mixed.clone(),
                            },
                            None => PipelineError::Unresolved {
                                batch,
                                count: rejection.unresolved.len(),
                            },
                        };
                        BatchSignal::Failed(err)
                    }
                }
            }
            Err(err) => {
                if let Some(source) = err.run_level_store_error() {
                    return Err(MigrationError::from_store(source.clone()));
                }
                BatchSignal::Failed(err)
            }
        };

        coordinator.publish(batch, signal)?;
        Ok(())
    }

    /// Records the terminal result of one upload worker.
    fn finish_batch(
        &self,
        run: &PipelineRun,
        ctx: &BatchContext,
        joined: Result<BatchOutcome, JoinError>,
        report: &mut ContainerReport,
        progress: &mut ProgressState,
    ) -> Result<(), MigrationError> {
        let outcome =
            joined.map_err(|e| MigrationError::Pipeline(format!("upload worker failed: {}", e)))?;

        match &outcome.result {
            Ok(()) => {
                report.batches_uploaded += 1;
                metrics::record_batch("uploaded");
            }
            Err(err) => {
                if let Some(source) = err.run_level_store_error() {
                    return Err(MigrationError::from_store(source.clone()));
                }
                if matches!(err, PipelineError::Cancelled { .. }) {
                    return Err(MigrationError::Cancelled);
                }
                ctx.tracker.advance(outcome.batch, BatchState::Failed);
                warn!(
                    container = %run.container_name,
                    batch = outcome.batch,
                    class = %err.class(),
                    error = %err,
                    "Batch failed"
                );
                report.batches_failed += 1;
                report.failures.push(BatchFailure::from(err));
                metrics::record_batch("failed");
            }
        }

        progress.processed += outcome.images;
        progress.reported = true;
        self.progress
            .report(run.source_container, progress.processed);
        Ok(())
    }
}

fn record_counts(report: &mut ContainerReport, counts: &OutcomeCounts, unresolved: &[ObjectError]) {
    report.outcomes.merge(counts);
    metrics::record_outcomes(counts);
    report
        .unresolved
        .extend(unresolved.iter().map(UnresolvedObject::from));
}
