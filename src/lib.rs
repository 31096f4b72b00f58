//! annotation-validator: migrate annotated image projects while validating
//! their geometries.
//!
//! A source project is copied container by container into a new project.
//! Every annotated object is checked against the geometry rules and invalid
//! objects are tagged for review, corrected or removed in the copy.

pub mod annotation;
pub mod cli;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod validation;

// Re-export commonly used error types
pub use error::{ErrorClass, MigrationError, ObjectError, PipelineError, StoreError};
