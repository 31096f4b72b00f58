//! Prometheus metrics for migration runs.
//!
//! # Example
//!
//! ```ignore
//! use annotation_validator::metrics::{export_metrics, init_metrics};
//!
//! init_metrics()?;
//! // ... run a migration ...
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{record_batch, record_container, record_outcomes, record_retry};
pub use prometheus::{export_metrics, init_metrics};
pub use prometheus::{BATCHES_TOTAL, CONTAINER_DURATION, OBJECTS_TOTAL, REGISTRY, STORE_RETRIES_TOTAL};
