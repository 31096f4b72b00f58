//! Dispatch table from geometry kind to validity predicate and corrector.
//!
//! The table is built once with [`RuleRegistryBuilder`] and is read-only
//! afterwards; share it across tasks behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::annotation::{AnnotatedObject, GeometryKind};

use super::{polygon, polyline};

/// Validity predicate for one geometry kind.
pub type Validator = Arc<dyn Fn(&AnnotatedObject) -> bool + Send + Sync>;

/// Corrector for one geometry kind. Must return an object its kind's
/// validator accepts whenever correction is possible.
pub type Corrector = Arc<dyn Fn(AnnotatedObject) -> AnnotatedObject + Send + Sync>;

/// Settings of the built-in rules.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    /// Minimum exterior vertices of a valid polygon.
    pub min_polygon_vertices: usize,
    /// Register the polyline padding corrector.
    pub correct_polylines: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            min_polygon_vertices: polygon::DEFAULT_MIN_EXTERIOR_VERTICES,
            correct_polylines: false,
        }
    }
}

impl RuleConfig {
    pub fn with_min_polygon_vertices(mut self, min: usize) -> Self {
        self.min_polygon_vertices = min;
        self
    }

    pub fn with_polyline_correction(mut self, enabled: bool) -> Self {
        self.correct_polylines = enabled;
        self
    }
}

/// Read-only rule table.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    validators: HashMap<GeometryKind, Validator>,
    correctors: HashMap<GeometryKind, Corrector>,
}

impl RuleRegistry {
    pub fn builder() -> RuleRegistryBuilder {
        RuleRegistryBuilder::default()
    }

    /// Builds the standard table: polygon and polyline rules, pass-through
    /// rules for bitmap, rectangle, point and graph nodes.
    pub fn standard(config: &RuleConfig) -> Self {
        let mut builder = Self::builder()
            .validator(
                GeometryKind::Polygon,
                polygon::validator(config.min_polygon_vertices),
            )
            .corrector(
                GeometryKind::Polygon,
                polygon::corrector(config.min_polygon_vertices),
            )
            .validator(GeometryKind::Polyline, polyline::is_valid_polyline);

        for kind in [
            GeometryKind::Bitmap,
            GeometryKind::Rectangle,
            GeometryKind::Point,
            GeometryKind::GraphNodes,
        ] {
            builder = builder
                .validator(kind.clone(), |_: &AnnotatedObject| true)
                .corrector(kind, |obj: AnnotatedObject| obj);
        }

        if config.correct_polylines {
            builder = builder.corrector(GeometryKind::Polyline, polyline::pad_polyline);
        }

        builder.build()
    }

    pub fn validator(&self, kind: &GeometryKind) -> Option<&Validator> {
        self.validators.get(kind)
    }

    pub fn corrector(&self, kind: &GeometryKind) -> Option<&Corrector> {
        self.correctors.get(kind)
    }

    /// Runs the kind's predicate. Kinds without a rule are valid.
    pub fn is_valid(&self, obj: &AnnotatedObject) -> bool {
        match self.validators.get(&obj.kind) {
            Some(validate) => validate(obj),
            None => true,
        }
    }

    #[cfg(test)]
    pub fn has_rule(&self, kind: &GeometryKind) -> bool {
        self.validators.contains_key(kind)
    }

    #[cfg(test)]
    pub fn can_correct(&self, kind: &GeometryKind) -> bool {
        self.correctors.contains_key(kind)
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut validated: Vec<&str> = self.validators.keys().map(GeometryKind::as_str).collect();
        let mut corrected: Vec<&str> = self.correctors.keys().map(GeometryKind::as_str).collect();
        validated.sort_unstable();
        corrected.sort_unstable();
        f.debug_struct("RuleRegistry")
            .field("validators", &validated)
            .field("correctors", &corrected)
            .finish()
    }
}

/// Builder for [`RuleRegistry`].
#[derive(Default)]
pub struct RuleRegistryBuilder {
    validators: HashMap<GeometryKind, Validator>,
    correctors: HashMap<GeometryKind, Corrector>,
}

impl RuleRegistryBuilder {
    /// Registers (or replaces) the validator of a kind.
    pub fn validator<F>(mut self, kind: GeometryKind, f: F) -> Self
    where
        F: Fn(&AnnotatedObject) -> bool + Send + Sync + 'static,
    {
        self.validators.insert(kind, Arc::new(f));
        self
    }

    /// Registers (or replaces) the corrector of a kind.
    pub fn corrector<F>(mut self, kind: GeometryKind, f: F) -> Self
    where
        F: Fn(AnnotatedObject) -> AnnotatedObject + Send + Sync + 'static,
    {
        self.correctors.insert(kind, Arc::new(f));
        self
    }

    pub fn build(self) -> RuleRegistry {
        RuleRegistry {
            validators: self.validators,
            correctors: self.correctors,
        }
    }
}
