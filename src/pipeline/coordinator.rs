//! Hands validated batch results to upload workers and turns them into
//! destination writes.
//!
//! Every batch index is registered once and receives exactly one signal:
//! either its [`BatchResult`] or the error that failed it. Upload workers
//! wait on that signal, so nothing is written before validation finishes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::annotation::{ContainerId, Geometry, ImageId, ObjectId};
use crate::error::{PipelineError, StoreError};
use crate::store::{with_retry, DestinationStore, RetryPolicy};
use crate::validation::BatchResult;

/// What an upload worker learns about its batch.
#[derive(Debug)]
pub enum BatchSignal {
    Validated(BatchResult),
    Failed(PipelineError),
}

/// Routes per-batch results from the validation loop to upload workers.
pub struct UploadCoordinator {
    destination: Arc<dyn DestinationStore>,
    retry: RetryPolicy,
    senders: Mutex<HashMap<usize, oneshot::Sender<BatchSignal>>>,
}

impl UploadCoordinator {
    pub fn new(destination: Arc<dyn DestinationStore>, retry: RetryPolicy) -> Self {
        Self {
            destination,
            retry,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the signal channel of a batch. Called once per index.
    pub fn register(&self, batch: usize) -> oneshot::Receiver<BatchSignal> {
        let (tx, rx) = oneshot::channel();
        self.senders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(batch, tx);
        rx
    }

    /// Delivers the single signal of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateResult`] if the batch was never
    /// registered or already received its signal.
    pub fn publish(&self, batch: usize, signal: BatchSignal) -> Result<(), PipelineError> {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&batch)
            .ok_or(PipelineError::DuplicateResult { batch })?;

        if sender.send(signal).is_err() {
            // Upload worker already gone, which only happens on cancellation.
            debug!(batch, "Upload worker dropped before batch signal");
        }
        Ok(())
    }

    /// Writes one batch result to the destination container.
    ///
    /// Returns the number of write operations issued.
    pub async fn dispatch(
        &self,
        batch: usize,
        container: ContainerId,
        result: BatchResult,
    ) -> Result<usize, PipelineError> {
        let store_err = |operation: &'static str| {
            move |source: StoreError| PipelineError::Store {
                batch,
                operation,
                source,
            }
        };
        let store = &self.destination;
        let tagged_images = result.tagged_images();

        match result {
            BatchResult::Empty => Ok(0),
            BatchResult::TagAssignments(assignments) => {
                let images = tagged_images;
                let Some(tag) = assignments.first().map(|a| a.tag.clone()) else {
                    return Ok(0);
                };

                with_retry(&self.retry, "add_tag_to_objects", || {
                    store.add_tag_to_objects(container, &assignments)
                })
                .await
                .map_err(store_err("add_tag_to_objects"))?;

                with_retry(&self.retry, "add_tag_to_images", || {
                    store.add_tag_to_images(container, &images, &tag)
                })
                .await
                .map_err(store_err("add_tag_to_images"))?;

                debug!(
                    batch,
                    objects = assignments.len(),
                    images = images.len(),
                    "Tagged invalid objects"
                );
                Ok(2)
            }
            BatchResult::CorrectedGeometries(corrections) => {
                let (ids, geometries): (Vec<ObjectId>, Vec<Geometry>) = corrections
                    .into_iter()
                    .map(|c| (c.object_id, c.geometry))
                    .unzip();

                with_retry(&self.retry, "replace_object_geometries", || {
                    store.replace_object_geometries(&ids, &geometries)
                })
                .await
                .map_err(store_err("replace_object_geometries"))?;

                debug!(batch, objects = ids.len(), "Replaced corrected geometries");
                Ok(1)
            }
            BatchResult::CleanedAnnotations(annotations) => {
                let images: Vec<ImageId> = annotations.iter().map(|a| a.image_id).collect();

                with_retry(&self.retry, "upload_annotations", || {
                    store.upload_annotations(container, &images, &annotations)
                })
                .await
                .map_err(store_err("upload_annotations"))?;

                debug!(batch, images = images.len(), "Uploaded cleaned annotations");
                Ok(1)
            }
        }
    }
}

impl std::fmt::Debug for UploadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.senders.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("UploadCoordinator")
            .field("retry", &self.retry)
            .field("pending", &pending)
            .finish()
    }
}
