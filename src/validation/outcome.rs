//! Per-object outcomes and per-batch results of the validation stage.

use serde::{Deserialize, Serialize};

use crate::annotation::{AnnotatedObject, Annotation, Geometry, ImageId, ObjectId, Tag};
use crate::error::ObjectError;

/// What happened to one object.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid,
    /// Invalid, marked with the review tag.
    InvalidTagged,
    /// Invalid, replaced by the carried corrected object.
    InvalidCorrected(AnnotatedObject),
    /// Invalid, dropped from the cleaned annotation.
    InvalidRemoved,
    /// Invalid and could not be handled. Always reported.
    InvalidUnresolved(ObjectError),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

/// A review tag to attach to one object.
#[derive(Debug, Clone, PartialEq)]
pub struct TagAssignment {
    pub image_id: ImageId,
    pub object_id: ObjectId,
    pub tag: Tag,
}

/// A geometry that replaces an object's current one.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedGeometry {
    pub image_id: ImageId,
    pub object_id: ObjectId,
    pub geometry: Geometry,
}

/// Outgoing work of one batch. Exactly one variant per batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BatchResult {
    #[default]
    Empty,
    TagAssignments(Vec<TagAssignment>),
    CorrectedGeometries(Vec<CorrectedGeometry>),
    /// Whole annotations with invalid objects removed.
    CleanedAnnotations(Vec<Annotation>),
}

impl BatchResult {
    pub fn is_empty(&self) -> bool {
        match self {
            BatchResult::Empty => true,
            BatchResult::TagAssignments(items) => items.is_empty(),
            BatchResult::CorrectedGeometries(items) => items.is_empty(),
            BatchResult::CleanedAnnotations(items) => items.is_empty(),
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            BatchResult::Empty => "empty",
            BatchResult::TagAssignments(_) => "tag_assignments",
            BatchResult::CorrectedGeometries(_) => "corrected_geometries",
            BatchResult::CleanedAnnotations(_) => "cleaned_annotations",
        }
    }

    /// Number of work items carried.
    pub fn len(&self) -> usize {
        match self {
            BatchResult::Empty => 0,
            BatchResult::TagAssignments(items) => items.len(),
            BatchResult::CorrectedGeometries(items) => items.len(),
            BatchResult::CleanedAnnotations(items) => items.len(),
        }
    }

    /// Distinct images touched by the tag assignments, in first-seen order.
    pub fn tagged_images(&self) -> Vec<ImageId> {
        let BatchResult::TagAssignments(items) = self else {
            return Vec::new();
        };
        let mut images: Vec<ImageId> = Vec::new();
        for item in items {
            if !images.contains(&item.image_id) {
                images.push(item.image_id);
            }
        }
        images
    }
}

/// Accumulates a [`BatchResult`] and refuses to mix variants.
#[derive(Debug, Default)]
pub struct BatchResultBuilder {
    result: BatchResult,
}

impl BatchResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_tag(&mut self, assignment: TagAssignment) -> Result<(), ObjectError> {
        if self.result == BatchResult::Empty {
            self.result = BatchResult::TagAssignments(Vec::new());
        }
        match &mut self.result {
            BatchResult::TagAssignments(items) => {
                items.push(assignment);
                Ok(())
            }
            _ => Err(ObjectError::MixedBatchResult),
        }
    }

    pub fn push_correction(&mut self, correction: CorrectedGeometry) -> Result<(), ObjectError> {
        if self.result == BatchResult::Empty {
            self.result = BatchResult::CorrectedGeometries(Vec::new());
        }
        match &mut self.result {
            BatchResult::CorrectedGeometries(items) => {
                items.push(correction);
                Ok(())
            }
            _ => Err(ObjectError::MixedBatchResult),
        }
    }

    pub fn push_cleaned(&mut self, annotation: Annotation) -> Result<(), ObjectError> {
        if self.result == BatchResult::Empty {
            self.result = BatchResult::CleanedAnnotations(Vec::new());
        }
        match &mut self.result {
            BatchResult::CleanedAnnotations(items) => {
                items.push(annotation);
                Ok(())
            }
            _ => Err(ObjectError::MixedBatchResult),
        }
    }

    pub fn build(self) -> BatchResult {
        self.result
    }
}

/// Object counts of a batch, container or run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub valid: usize,
    pub tagged: usize,
    pub corrected: usize,
    pub removed: usize,
    pub unresolved: usize,
    /// Invalid objects whose JSON failed schema decoding (subset of the above).
    pub undecodable: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &ValidationOutcome) {
        match outcome {
            ValidationOutcome::Valid => self.valid += 1,
            ValidationOutcome::InvalidTagged => self.tagged += 1,
            ValidationOutcome::InvalidCorrected(_) => self.corrected += 1,
            ValidationOutcome::InvalidRemoved => self.removed += 1,
            ValidationOutcome::InvalidUnresolved(_) => self.unresolved += 1,
        }
    }

    pub fn invalid(&self) -> usize {
        self.tagged + self.corrected + self.removed + self.unresolved
    }

    pub fn total(&self) -> usize {
        self.valid + self.invalid()
    }

    pub fn merge(&mut self, other: &OutcomeCounts) {
        self.valid += other.valid;
        self.tagged += other.tagged;
        self.corrected += other.corrected;
        self.removed += other.removed;
        self.unresolved += other.unresolved;
        self.undecodable += other.undecodable;
    }
}
