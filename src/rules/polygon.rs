//! Polygon validity rule and corrector.

use crate::annotation::{AnnotatedObject, Point, Points};

/// Default minimum vertex count of a polygon's exterior ring.
pub const DEFAULT_MIN_EXTERIOR_VERTICES: usize = 3;

/// Minimum vertex count of a non-empty ring.
pub const MIN_RING_VERTICES: usize = 3;

/// Returns true when the exterior ring has at least `min_exterior` vertices
/// and every interior ring is either empty or has at least three vertices.
pub fn is_valid_polygon(points: &Points, min_exterior: usize) -> bool {
    if points.exterior.len() < min_exterior {
        return false;
    }
    points
        .interior
        .iter()
        .all(|ring| ring.is_empty() || ring.len() >= MIN_RING_VERTICES)
}

/// Pads a ring by repeating its last vertex until it reaches `target`.
///
/// Empty rings are left alone: there is no vertex to repeat.
pub fn pad_ring(ring: &mut Vec<Point>, target: usize) {
    if let Some(&last) = ring.last() {
        while ring.len() < target {
            ring.push(last);
        }
    }
}

/// Builds the polygon validator for a given exterior threshold.
pub fn validator(min_exterior: usize) -> impl Fn(&AnnotatedObject) -> bool + Send + Sync {
    move |obj| {
        obj.points()
            .map(|points| is_valid_polygon(points, min_exterior))
            .unwrap_or(false)
    }
}

/// Builds the polygon corrector for a given exterior threshold.
pub fn corrector(
    min_exterior: usize,
) -> impl Fn(AnnotatedObject) -> AnnotatedObject + Send + Sync {
    let exterior_target = min_exterior.max(MIN_RING_VERTICES);
    move |mut obj| {
        if let Some(points) = obj.geometry.as_points_mut() {
            pad_ring(&mut points.exterior, exterior_target);
            for ring in points.interior.iter_mut() {
                pad_ring(ring, MIN_RING_VERTICES);
            }
        }
        obj
    }
}
