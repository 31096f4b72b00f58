//! Error types for annotation-validator operations.
//!
//! Defines the error enums of the main subsystems:
//! - Store access (source and destination)
//! - Object validation and correction
//! - Single batches in the pipeline
//! - Whole-run migration
//!
//! Every store error is mapped onto the closed [`ErrorClass`] taxonomy by
//! [`classify`]; retry and abort decisions look only at the class.

use thiserror::Error;

use crate::annotation::{ContainerId, GeometryKind, ObjectId};

/// Errors reported by a source or destination store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Store error: {0}")]
    Other(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::InvalidRequest(format!("JSON error: {}", err))
    }
}

/// Closed error taxonomy used for reporting and control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// An object could not be decoded against the schema.
    Deserialization,
    /// An object failed its kind's validity predicate.
    ValidationFailure,
    /// Correct mode, invalid object, no corrector registered.
    UncorrectableObject,
    /// Network or timeout failure; retried with backoff.
    TransientStore,
    /// Quota, payment or authorization failure; aborts the run.
    FatalStore,
    /// Anything else; propagated unchanged.
    Unclassified,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::TransientStore)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorClass::FatalStore)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Deserialization => write!(f, "deserialization_error"),
            ErrorClass::ValidationFailure => write!(f, "validation_failure"),
            ErrorClass::UncorrectableObject => write!(f, "uncorrectable_object"),
            ErrorClass::TransientStore => write!(f, "transient_store_error"),
            ErrorClass::FatalStore => write!(f, "fatal_store_error"),
            ErrorClass::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Classifies a store error.
pub fn classify(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Timeout(_) | StoreError::Connection(_) | StoreError::RateLimited(_) => {
            ErrorClass::TransientStore
        }
        StoreError::Http { status, .. } => match status {
            402 => ErrorClass::FatalStore,
            401 | 403 => ErrorClass::FatalStore,
            408 | 429 => ErrorClass::TransientStore,
            500..=599 => ErrorClass::TransientStore,
            _ => ErrorClass::Unclassified,
        },
        StoreError::PaymentRequired(_)
        | StoreError::QuotaExceeded(_)
        | StoreError::Unauthorized(_)
        | StoreError::Forbidden(_) => ErrorClass::FatalStore,
        StoreError::NotFound { .. }
        | StoreError::InvalidRequest(_)
        | StoreError::Io(_)
        | StoreError::Other(_) => ErrorClass::Unclassified,
    }
}

/// Per-object errors raised by the validation stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObjectError {
    #[error("Object {object_id} ({kind}) in container {container_id} is invalid and no corrector is registered")]
    Uncorrectable {
        object_id: ObjectId,
        kind: GeometryKind,
        container_id: ContainerId,
    },

    #[error("Object without id in image {image_id} of container {container_id} cannot be {action}")]
    MissingObjectId {
        image_id: u64,
        container_id: ContainerId,
        action: &'static str,
    },

    #[error("Batch result mixes tag assignments and corrected geometries")]
    MixedBatchResult,
}

impl ObjectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ObjectError::Uncorrectable { .. } => ErrorClass::UncorrectableObject,
            ObjectError::MissingObjectId { .. } => ErrorClass::Deserialization,
            ObjectError::MixedBatchResult => ErrorClass::Unclassified,
        }
    }
}

/// Errors that fail a single batch. Other batches keep going.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Batch {batch}: {operation} failed: {source}")]
    Store {
        batch: usize,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("Batch {batch}: annotation of image {image_id} is not decodable: {reason}")]
    Decode {
        batch: usize,
        image_id: u64,
        reason: String,
    },

    #[error("Batch {batch}: {count} object(s) could not be resolved")]
    Unresolved { batch: usize, count: usize },

    #[error("Batch {batch}: {source}")]
    Object {
        batch: usize,
        #[source]
        source: ObjectError,
    },

    #[error("Batch {batch}: result already published")]
    DuplicateResult { batch: usize },

    #[error("Batch {batch}: cancelled before completion")]
    Cancelled { batch: usize },
}

impl PipelineError {
    pub fn batch(&self) -> usize {
        match self {
            PipelineError::Store { batch, .. }
            | PipelineError::Decode { batch, .. }
            | PipelineError::Unresolved { batch, .. }
            | PipelineError::Object { batch, .. }
            | PipelineError::DuplicateResult { batch }
            | PipelineError::Cancelled { batch } => *batch,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Store { source, .. } => classify(source),
            PipelineError::Decode { .. } => ErrorClass::Deserialization,
            PipelineError::Unresolved { .. } => ErrorClass::UncorrectableObject,
            PipelineError::Object { source, .. } => source.class(),
            PipelineError::DuplicateResult { .. } | PipelineError::Cancelled { .. } => {
                ErrorClass::Unclassified
            }
        }
    }

    /// The underlying store error when it must abort the run.
    ///
    /// Fatal errors abort by definition. Unclassified store errors are not
    /// batch-local either and propagate unchanged. Transient errors that
    /// ran out of retries stay with their batch.
    pub fn run_level_store_error(&self) -> Option<&StoreError> {
        match self {
            PipelineError::Store { source, .. } => match classify(source) {
                ErrorClass::FatalStore | ErrorClass::Unclassified => Some(source),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Errors that abort a container run or the whole migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::pipeline::ConfigError),

    #[error("Fatal store error ({class}): {source}")]
    FatalStore {
        class: ErrorClass,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Dataset {0} not found in project tree")]
    DatasetNotFound(ContainerId),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error(transparent)]
    Batch(#[from] PipelineError),

    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrationError {
    /// Wraps a store error, keeping fatal classification intact.
    pub fn from_store(err: StoreError) -> Self {
        match classify(&err) {
            class @ ErrorClass::FatalStore => MigrationError::FatalStore { class, source: err },
            _ => MigrationError::Store(err),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::FatalStore { class, .. } => *class,
            MigrationError::Store(err) => classify(err),
            MigrationError::Batch(err) => err.class(),
            _ => ErrorClass::Unclassified,
        }
    }
}
