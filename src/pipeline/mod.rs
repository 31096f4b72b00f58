//! Migration pipeline.
//!
//! # Architecture
//!
//! - **Orchestrator**: walks the source container tree and mirrors it
//! - **Batch pipeline**: per-container download and upload pools
//! - **Cache**: one single-assignment cell per batch index
//! - **Coordinator**: validated results to destination writes
//! - **Config**: pool sizes, paging, retry and rule settings
//!
//! # Pipeline Flow
//!
//! 1. **Project setup**: the destination project is created from the source
//!    meta; in tag mode the review tag is registered
//! 2. **Container mirroring**: each container is created under its mirrored parent
//! 3. **Copy**: images are listed page by page and copied to the destination
//! 4. **Download**: batches of copied images are downloaded and decoded, once each
//! 5. **Validation**: every object is validated, then tagged, corrected or removed
//! 6. **Upload**: each batch result becomes tag, geometry or annotation writes
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use annotation_validator::pipeline::{
//!     MigrationConfig, RunConfig, RunMode, TracingProgress, TreeOrchestrator,
//! };
//!
//! let orchestrator = TreeOrchestrator::new(
//!     store.clone(),
//!     store.clone(),
//!     MigrationConfig::from_env()?,
//!     Arc::new(TracingProgress::new()),
//! )?;
//! let report = orchestrator
//!     .run(&RunConfig::new(project_id, RunMode::tag("Invalid Annotation")))
//!     .await?;
//! println!("{} images, {} failed batches", report.images, report.batches_failed);
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod orchestrator;
pub mod progress;
pub mod run;

pub use batch::{
    BatchFailure, BatchPipeline, BatchState, BatchTracker, ContainerReport, UnresolvedObject,
};
pub use cache::{AnnotationCache, CacheEntry, CachedBatch};
pub use config::{ConfigError, MigrationConfig, RunConfig};
pub use coordinator::{BatchSignal, UploadCoordinator};
pub use orchestrator::{new_project_name, MigrationReport, TreeOrchestrator};
pub use progress::{ProgressReporter, RecordingProgress, TracingProgress};
pub use run::{PipelineRun, RunMode, DEFAULT_TAG_NAME};
