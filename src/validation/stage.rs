//! Validation/correction stage.
//!
//! Runs every object of a downloaded batch through the rule registry, in
//! order, and turns the outcomes into a single [`BatchResult`].

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::annotation::{AnnotatedObject, Annotation, GeometryKind, ObjectEntry, UndecodableObject};
use crate::error::ObjectError;
use crate::pipeline::{PipelineRun, RunMode};
use crate::rules::RuleRegistry;

use super::outcome::{
    BatchResult, BatchResultBuilder, CorrectedGeometry, OutcomeCounts, TagAssignment,
    ValidationOutcome,
};

/// Result of validating one batch.
#[derive(Debug, Clone)]
pub struct BatchValidation {
    pub result: BatchResult,
    pub counts: OutcomeCounts,
    /// Objects that could not be handled and were left out of `result`.
    pub unresolved: Vec<ObjectError>,
}

/// A batch rejected because at least one object could not be handled.
#[derive(Debug, Clone)]
pub struct BatchRejection {
    pub counts: OutcomeCounts,
    pub unresolved: Vec<ObjectError>,
}

/// Stateless validation stage shared by all batches of a run.
#[derive(Debug, Clone)]
pub struct ValidationStage {
    registry: Arc<RuleRegistry>,
    allow_partial_batches: bool,
}

impl ValidationStage {
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            allow_partial_batches: false,
        }
    }

    /// Lets a batch succeed without its unresolved objects instead of
    /// failing as a whole.
    pub fn with_partial_batches(mut self, allow: bool) -> Self {
        self.allow_partial_batches = allow;
        self
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Validates a batch of annotations for one container run.
    ///
    /// # Errors
    ///
    /// Returns a [`BatchRejection`] when an object is unresolved and partial
    /// batches are not allowed, or when the result would mix variants.
    pub fn validate_batch(
        &self,
        run: &PipelineRun,
        annotations: &[Annotation],
    ) -> Result<BatchValidation, BatchRejection> {
        let mut builder = BatchResultBuilder::new();
        let mut counts = OutcomeCounts::default();
        let mut unresolved = Vec::new();

        for annotation in annotations {
            let mut kept: Vec<ObjectEntry> = Vec::with_capacity(annotation.objects.len());
            let mut removed_any = false;

            for entry in &annotation.objects {
                if matches!(entry, ObjectEntry::Undecodable(_)) {
                    counts.undecodable += 1;
                }

                let outcome = self.validate_object(run, annotation, entry);
                counts.record(&outcome);

                let pushed = match &outcome {
                    ValidationOutcome::Valid => {
                        kept.push(entry.clone());
                        Ok(())
                    }
                    ValidationOutcome::InvalidTagged => match (&run.mode, entry.id()) {
                        (RunMode::Tag { tag }, Some(object_id)) => builder.push_tag(TagAssignment {
                            image_id: annotation.image_id,
                            object_id,
                            tag: tag.to_tag(),
                        }),
                        _ => Ok(()),
                    },
                    ValidationOutcome::InvalidCorrected(fixed) => {
                        builder.push_correction(CorrectedGeometry {
                            image_id: annotation.image_id,
                            object_id: fixed.id,
                            geometry: fixed.geometry.clone(),
                        })
                    }
                    ValidationOutcome::InvalidRemoved => {
                        removed_any = true;
                        Ok(())
                    }
                    ValidationOutcome::InvalidUnresolved(err) => {
                        error!(
                            container_id = run.source_container,
                            image_id = annotation.image_id,
                            object_id = ?entry.id(),
                            kind = ?entry.kind().map(GeometryKind::as_str),
                            error = %err,
                            "Object could not be resolved"
                        );
                        unresolved.push(err.clone());
                        Ok(())
                    }
                };

                if let Err(err) = pushed {
                    unresolved.push(err);
                    return Err(BatchRejection { counts, unresolved });
                }
            }

            if removed_any {
                let cleaned = Annotation {
                    objects: kept,
                    ..annotation.clone()
                };
                if let Err(err) = builder.push_cleaned(cleaned) {
                    unresolved.push(err);
                    return Err(BatchRejection { counts, unresolved });
                }
            }
        }

        if !unresolved.is_empty() && !self.allow_partial_batches {
            return Err(BatchRejection { counts, unresolved });
        }

        Ok(BatchValidation {
            result: builder.build(),
            counts,
            unresolved,
        })
    }

    /// Classifies one object according to the run mode.
    pub fn validate_object(
        &self,
        run: &PipelineRun,
        annotation: &Annotation,
        entry: &ObjectEntry,
    ) -> ValidationOutcome {
        match entry {
            ObjectEntry::Decoded(obj) => {
                if self.registry.is_valid(obj) {
                    return ValidationOutcome::Valid;
                }
                debug!(object_id = obj.id, kind = %obj.kind, "Object failed validation");
                self.handle_invalid(run, obj)
            }
            ObjectEntry::Undecodable(raw) => self.handle_undecodable(run, annotation, raw),
        }
    }

    fn handle_invalid(&self, run: &PipelineRun, obj: &AnnotatedObject) -> ValidationOutcome {
        match &run.mode {
            RunMode::Tag { .. } => ValidationOutcome::InvalidTagged,
            RunMode::Remove => ValidationOutcome::InvalidRemoved,
            RunMode::Correct => {
                let uncorrectable = || {
                    ValidationOutcome::InvalidUnresolved(ObjectError::Uncorrectable {
                        object_id: obj.id,
                        kind: obj.kind.clone(),
                        container_id: run.source_container,
                    })
                };

                let Some(correct) = self.registry.corrector(&obj.kind) else {
                    return uncorrectable();
                };

                let fixed = correct(obj.clone());
                if self.registry.is_valid(&fixed) {
                    ValidationOutcome::InvalidCorrected(fixed)
                } else {
                    warn!(
                        object_id = obj.id,
                        kind = %obj.kind,
                        "Corrector did not produce a valid geometry"
                    );
                    uncorrectable()
                }
            }
        }
    }

    fn handle_undecodable(
        &self,
        run: &PipelineRun,
        annotation: &Annotation,
        raw: &UndecodableObject,
    ) -> ValidationOutcome {
        debug!(object_id = ?raw.id, reason = %raw.reason, "Undecodable object treated as invalid");
        match (&run.mode, raw.id) {
            (RunMode::Remove, _) => ValidationOutcome::InvalidRemoved,
            (RunMode::Tag { .. }, Some(_)) => ValidationOutcome::InvalidTagged,
            (RunMode::Correct, Some(object_id)) => {
                ValidationOutcome::InvalidUnresolved(ObjectError::Uncorrectable {
                    object_id,
                    kind: raw
                        .kind
                        .clone()
                        .unwrap_or_else(|| GeometryKind::Other("unknown".to_string())),
                    container_id: run.source_container,
                })
            }
            (mode, None) => ValidationOutcome::InvalidUnresolved(ObjectError::MissingObjectId {
                image_id: annotation.image_id,
                container_id: run.source_container,
                action: if matches!(mode, RunMode::Tag { .. }) {
                    "tagged"
                } else {
                    "corrected"
                },
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{decode_object, Geometry, Points};
    use crate::rules::RuleConfig;
    use serde_json::json;

    fn stage(config: RuleConfig) -> ValidationStage {
        ValidationStage::new(Arc::new(RuleRegistry::standard(&config)))
    }

    fn run(mode: RunMode) -> PipelineRun {
        PipelineRun::new(1, 100, "train", mode)
    }

    fn object(id: u64, kind: GeometryKind, exterior: Vec<[f64; 2]>) -> ObjectEntry {
        ObjectEntry::Decoded(AnnotatedObject::with_points(id, kind, Points::new(exterior)))
    }

    fn short_polygon(id: u64) -> ObjectEntry {
        object(id, GeometryKind::Polygon, vec![[0.0, 0.0], [3.0, 3.0]])
    }

    fn valid_rectangle(id: u64) -> ObjectEntry {
        object(id, GeometryKind::Rectangle, vec![[0.0, 0.0], [3.0, 3.0]])
    }

    #[test]
    fn test_tag_mode_emits_one_assignment_per_invalid_object() {
        let anns = vec![
            Annotation::new(10, vec![short_polygon(1), valid_rectangle(2)]),
            Annotation::new(11, vec![object(3, GeometryKind::Polyline, vec![[1.0, 1.0]])]),
        ];

        let validation = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::tag("Invalid Annotation")), &anns)
            .unwrap();

        let BatchResult::TagAssignments(items) = &validation.result else {
            panic!("expected tag assignments, got {:?}", validation.result);
        };
        let ids: Vec<u64> = items.iter().map(|a| a.object_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(items.iter().all(|a| a.tag.name == "Invalid Annotation"));
        assert_eq!(validation.counts.tagged, 2);
        assert_eq!(validation.counts.valid, 1);
    }

    #[test]
    fn test_correct_mode_emits_corrected_geometry() {
        let anns = vec![Annotation::new(10, vec![short_polygon(1), valid_rectangle(2)])];

        let validation = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::Correct), &anns)
            .unwrap();

        let BatchResult::CorrectedGeometries(items) = &validation.result else {
            panic!("expected corrected geometries");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].object_id, 1);
        let Geometry::Points(points) = &items[0].geometry else {
            panic!("expected points");
        };
        assert_eq!(points.exterior, vec![[0.0, 0.0], [3.0, 3.0], [3.0, 3.0]]);
    }

    #[test]
    fn test_correct_mode_without_corrector_rejects_batch() {
        let anns = vec![Annotation::new(
            10,
            vec![short_polygon(1), object(3, GeometryKind::Polyline, vec![[1.0, 1.0]])],
        )];

        let rejection = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::Correct), &anns)
            .unwrap_err();

        assert_eq!(rejection.unresolved.len(), 1);
        assert_eq!(
            rejection.unresolved[0],
            ObjectError::Uncorrectable {
                object_id: 3,
                kind: GeometryKind::Polyline,
                container_id: 1,
            }
        );
        assert_eq!(rejection.counts.corrected, 1);
        assert_eq!(rejection.counts.unresolved, 1);
    }

    #[test]
    fn test_partial_batches_keep_resolved_objects() {
        let anns = vec![Annotation::new(
            10,
            vec![short_polygon(1), object(3, GeometryKind::Polyline, vec![[1.0, 1.0]])],
        )];

        let validation = stage(RuleConfig::default())
            .with_partial_batches(true)
            .validate_batch(&run(RunMode::Correct), &anns)
            .unwrap();

        assert_eq!(validation.result.len(), 1);
        assert_eq!(validation.unresolved.len(), 1);
    }

    #[test]
    fn test_polyline_corrector_when_registered() {
        let anns = vec![Annotation::new(
            10,
            vec![object(3, GeometryKind::Polyline, vec![[1.0, 1.0]])],
        )];

        let validation = stage(RuleConfig::default().with_polyline_correction(true))
            .validate_batch(&run(RunMode::Correct), &anns)
            .unwrap();

        let BatchResult::CorrectedGeometries(items) = &validation.result else {
            panic!("expected corrected geometries");
        };
        assert_eq!(
            items[0].geometry.as_points().unwrap().exterior,
            vec![[1.0, 1.0], [1.0, 1.0]]
        );
    }

    #[test]
    fn test_undecodable_object_is_tagged() {
        let broken = decode_object(&json!({"id": 8, "geometryType": "polygon"}));
        let anns = vec![Annotation::new(10, vec![broken])];

        let validation = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::tag("review")), &anns)
            .unwrap();

        assert_eq!(validation.counts.undecodable, 1);
        assert_eq!(validation.counts.tagged, 1);
        assert_eq!(validation.result.len(), 1);
    }

    #[test]
    fn test_undecodable_object_is_uncorrectable() {
        let broken = decode_object(&json!({"id": 8, "geometryType": "polygon"}));
        let anns = vec![Annotation::new(10, vec![broken])];

        let rejection = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::Correct), &anns)
            .unwrap_err();
        assert!(matches!(
            rejection.unresolved[0],
            ObjectError::Uncorrectable { object_id: 8, .. }
        ));
    }

    #[test]
    fn test_remove_mode_cleans_only_touched_annotations() {
        let anns = vec![
            Annotation::new(10, vec![short_polygon(1), valid_rectangle(2)]),
            Annotation::new(11, vec![valid_rectangle(3)]),
        ];

        let validation = stage(RuleConfig::default())
            .validate_batch(&run(RunMode::Remove), &anns)
            .unwrap();

        let BatchResult::CleanedAnnotations(items) = &validation.result else {
            panic!("expected cleaned annotations");
        };
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].image_id, 10);
        assert_eq!(items[0].objects.len(), 1);
        assert_eq!(items[0].objects[0].id(), Some(2));
    }

    #[test]
    fn test_all_valid_batch_is_empty() {
        let anns = vec![Annotation::new(10, vec![valid_rectangle(2)])];
        for mode in [RunMode::tag("x"), RunMode::Correct, RunMode::Remove] {
            let validation = stage(RuleConfig::default())
                .validate_batch(&run(mode), &anns)
                .unwrap();
            assert!(validation.result.is_empty());
            assert_eq!(validation.result, BatchResult::Empty);
        }
    }
}
