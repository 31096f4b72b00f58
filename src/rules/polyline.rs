//! Polyline validity rule and optional corrector.

use crate::annotation::AnnotatedObject;

use super::polygon::pad_ring;

/// Minimum vertex count of a polyline.
pub const MIN_POLYLINE_VERTICES: usize = 2;

pub fn is_valid_polyline(obj: &AnnotatedObject) -> bool {
    obj.points()
        .map(|points| points.exterior.len() >= MIN_POLYLINE_VERTICES)
        .unwrap_or(false)
}

/// Repeats the last vertex of a short polyline until it has two points.
///
/// Not registered by default; enable it with
/// `RuleConfig::correct_polylines`.
pub fn pad_polyline(mut obj: AnnotatedObject) -> AnnotatedObject {
    if let Some(points) = obj.geometry.as_points_mut() {
        pad_ring(&mut points.exterior, MIN_POLYLINE_VERTICES);
    }
    obj
}
