//! Per-geometry validity rules.
//!
//! - **polygon**: exterior ring of at least N vertices (default 3), interior
//!   rings empty or with at least 3 vertices; short rings are padded by
//!   repeating their last vertex
//! - **polyline**: at least 2 vertices; padding corrector is opt-in
//! - **bitmap, rectangle, point, graph nodes**: always valid
//!
//! Rules are looked up through a [`RuleRegistry`] keyed by
//! [`GeometryKind`](crate::annotation::GeometryKind).

pub mod polygon;
pub mod polyline;
pub mod registry;

pub use registry::{Corrector, RuleConfig, RuleRegistry, RuleRegistryBuilder, Validator};
