//! Decoding of native annotation JSON into the in-memory model.
//!
//! A malformed object never fails the whole annotation: it is kept as an
//! [`UndecodableObject`] so the validation stage can route it down the
//! invalid path. Only a structurally broken annotation (no object list)
//! is reported as an error.

use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{
    AnnotatedObject, Annotation, BitmapRef, Geometry, GeometryKind, ObjectEntry, Points,
    RawAnnotation, Tag, UndecodableObject,
};

/// Errors raised when an annotation as a whole cannot be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Annotation of image {image_id} is not a JSON object")]
    NotAnObject { image_id: u64 },

    #[error("Annotation of image {image_id} has no 'objects' array")]
    MissingObjects { image_id: u64 },

    #[error("Invalid image tags in annotation of image {image_id}: {source}")]
    InvalidTags {
        image_id: u64,
        #[source]
        source: serde_json::Error,
    },
}

impl Annotation {
    /// Decodes a store annotation.
    pub fn decode(raw: &RawAnnotation) -> Result<Self, DecodeError> {
        let image_id = raw.image_id;
        let ann = raw
            .json
            .as_object()
            .ok_or(DecodeError::NotAnObject { image_id })?;

        let objects = ann
            .get("objects")
            .and_then(Value::as_array)
            .ok_or(DecodeError::MissingObjects { image_id })?
            .iter()
            .map(decode_object)
            .collect();

        let tags = match ann.get("tags") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|source| DecodeError::InvalidTags { image_id, source })?,
        };

        let mut extra = ann.clone();
        extra.remove("objects");
        extra.remove("tags");

        Ok(Self {
            image_id,
            objects,
            tags,
            extra,
        })
    }
}

/// Decodes one object, falling back to an undecodable entry on any schema error.
pub fn decode_object(value: &Value) -> ObjectEntry {
    match try_decode_object(value) {
        Ok(obj) => ObjectEntry::Decoded(obj),
        Err(reason) => {
            tracing::debug!(reason = %reason, "Object failed schema decoding");
            ObjectEntry::Undecodable(UndecodableObject {
                id: value.get("id").and_then(Value::as_u64),
                kind: value
                    .get("geometryType")
                    .and_then(Value::as_str)
                    .map(GeometryKind::parse),
                reason,
                raw: value.clone(),
            })
        }
    }
}

fn try_decode_object(value: &Value) -> Result<AnnotatedObject, String> {
    let obj = value.as_object().ok_or("object is not a JSON object")?;

    let id = obj
        .get("id")
        .and_then(Value::as_u64)
        .ok_or("missing or non-integer 'id'")?;
    let kind = obj
        .get("geometryType")
        .and_then(Value::as_str)
        .map(GeometryKind::parse)
        .ok_or("missing 'geometryType'")?;
    let class_title = obj
        .get("classTitle")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let (geometry, geometry_field) = decode_geometry(&kind, obj)?;

    let tags: Vec<Tag> = match obj.get("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(tags) => {
            serde_json::from_value(tags.clone()).map_err(|e| format!("invalid 'tags': {}", e))?
        }
    };
    let author = obj
        .get("labelerLogin")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut extra = obj.clone();
    for key in ["id", "geometryType", "classTitle", "tags", "labelerLogin", geometry_field] {
        extra.remove(key);
    }

    Ok(AnnotatedObject {
        id,
        kind,
        class_title,
        geometry,
        tags,
        author,
        extra,
    })
}

fn decode_geometry(
    kind: &GeometryKind,
    obj: &Map<String, Value>,
) -> Result<(Geometry, &'static str), String> {
    fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Result<&'a Value, String> {
        obj.get(name).ok_or_else(|| format!("missing '{}'", name))
    }

    match kind {
        k if k.uses_points() => {
            let points: Points = serde_json::from_value(field(obj, "points")?.clone())
                .map_err(|e| format!("invalid 'points': {}", e))?;
            Ok((Geometry::Points(points), "points"))
        }
        GeometryKind::Bitmap => {
            let bitmap: BitmapRef = serde_json::from_value(field(obj, "bitmap")?.clone())
                .map_err(|e| format!("invalid 'bitmap': {}", e))?;
            Ok((Geometry::Bitmap(bitmap), "bitmap"))
        }
        GeometryKind::GraphNodes => {
            let nodes = field(obj, "nodes")?
                .as_object()
                .ok_or("'nodes' is not an object")?
                .clone();
            Ok((Geometry::Nodes(nodes), "nodes"))
        }
        _ => Ok((
            Geometry::Opaque(obj.get("geometry").cloned().unwrap_or(Value::Null)),
            "geometry",
        )),
    }
}
