//! Validation and correction of annotated objects.
//!
//! This module turns decoded annotation batches into outgoing destination
//! work. Each object ends in exactly one [`ValidationOutcome`]; each batch
//! produces exactly one [`BatchResult`] variant.

pub mod outcome;
pub mod stage;

pub use outcome::{
    BatchResult, BatchResultBuilder, CorrectedGeometry, OutcomeCounts, TagAssignment,
    ValidationOutcome,
};
pub use stage::{BatchRejection, BatchValidation, ValidationStage};
