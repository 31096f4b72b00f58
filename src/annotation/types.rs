//! In-memory annotation model.
//!
//! Mirrors the platform's native annotation JSON closely enough to be
//! written back unchanged apart from the fields the validation stage touches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of an image inside a store.
pub type ImageId = u64;

/// Identifier of an annotated object inside a store.
pub type ObjectId = u64;

/// Identifier of a container (dataset) inside a store.
pub type ContainerId = u64;

/// Identifier of a project (the root of a container tree).
pub type ProjectId = u64;

/// A single `[x, y]` vertex.
pub type Point = [f64; 2];

/// Shape type of an annotated object.
///
/// Assigned at decode time from the object's `geometryType` field and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum GeometryKind {
    Polygon,
    Polyline,
    Bitmap,
    Rectangle,
    Point,
    GraphNodes,
    /// Any geometry type this crate has no model for.
    Other(String),
}

impl GeometryKind {
    /// Parses a `geometryType` value. Both the short and long spellings used
    /// by the platform are accepted.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "polygon" => GeometryKind::Polygon,
            "line" | "polyline" => GeometryKind::Polyline,
            "bitmap" => GeometryKind::Bitmap,
            "rectangle" => GeometryKind::Rectangle,
            "point" => GeometryKind::Point,
            "graph" | "graph-nodes" | "graph_nodes" => GeometryKind::GraphNodes,
            _ => GeometryKind::Other(name.to_string()),
        }
    }

    /// Returns the canonical `geometryType` spelling.
    pub fn as_str(&self) -> &str {
        match self {
            GeometryKind::Polygon => "polygon",
            GeometryKind::Polyline => "line",
            GeometryKind::Bitmap => "bitmap",
            GeometryKind::Rectangle => "rectangle",
            GeometryKind::Point => "point",
            GeometryKind::GraphNodes => "graph",
            GeometryKind::Other(name) => name,
        }
    }

    /// Returns all kinds with a dedicated geometry model.
    pub fn known() -> Vec<GeometryKind> {
        vec![
            GeometryKind::Polygon,
            GeometryKind::Polyline,
            GeometryKind::Bitmap,
            GeometryKind::Rectangle,
            GeometryKind::Point,
            GeometryKind::GraphNodes,
        ]
    }

    /// Returns true when the geometry is carried as `points.exterior/interior`.
    pub fn uses_points(&self) -> bool {
        matches!(
            self,
            GeometryKind::Polygon
                | GeometryKind::Polyline
                | GeometryKind::Rectangle
                | GeometryKind::Point
        )
    }
}

impl std::fmt::Display for GeometryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for GeometryKind {
    fn from(value: String) -> Self {
        GeometryKind::parse(&value)
    }
}

impl From<GeometryKind> for String {
    fn from(value: GeometryKind) -> Self {
        value.as_str().to_string()
    }
}

/// Point sequences of a vector geometry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Points {
    /// Outer ring (or the whole line for polylines).
    pub exterior: Vec<Point>,
    /// Holes. Always empty for non-polygon kinds.
    #[serde(default)]
    pub interior: Vec<Vec<Point>>,
}

impl Points {
    pub fn new(exterior: Vec<Point>) -> Self {
        Self {
            exterior,
            interior: Vec::new(),
        }
    }

    pub fn with_interior(mut self, ring: Vec<Point>) -> Self {
        self.interior.push(ring);
        self
    }
}

/// Raster mask reference of a bitmap object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitmapRef {
    /// Encoded mask payload.
    pub data: String,
    /// Top-left corner of the mask in image coordinates.
    pub origin: [i64; 2],
}

/// Kind-specific geometry payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Points(Points),
    Bitmap(BitmapRef),
    /// Graph nodes keyed by node id.
    Nodes(Map<String, Value>),
    /// Geometry of a kind without a dedicated model, kept verbatim.
    Opaque(Value),
}

impl Geometry {
    /// Returns the JSON field that carries this payload and its value.
    pub fn to_json_field(&self) -> (&'static str, Value) {
        match self {
            Geometry::Points(points) => ("points", serde_json::to_value(points).unwrap_or(Value::Null)),
            Geometry::Bitmap(bitmap) => ("bitmap", serde_json::to_value(bitmap).unwrap_or(Value::Null)),
            Geometry::Nodes(nodes) => ("nodes", Value::Object(nodes.clone())),
            Geometry::Opaque(value) => ("geometry", value.clone()),
        }
    }

    pub fn as_points(&self) -> Option<&Points> {
        match self {
            Geometry::Points(points) => Some(points),
            _ => None,
        }
    }

    pub fn as_points_mut(&mut self) -> Option<&mut Points> {
        match self {
            Geometry::Points(points) => Some(points),
            _ => None,
        }
    }
}

/// A tag attached to an object or an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Tag {
    /// Creates a value-less tag, the only tag type the validator emits.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// Review tag definition used in tag mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub name: String,
}

impl TagDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn to_tag(&self) -> Tag {
        Tag::named(&self.name)
    }
}

/// One labeled shape within an image's annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedObject {
    pub id: ObjectId,
    pub kind: GeometryKind,
    pub class_title: String,
    pub geometry: Geometry,
    pub tags: Vec<Tag>,
    /// Login of the labeler who created the object.
    pub author: Option<String>,
    /// Fields not modelled above, preserved for write-back.
    pub extra: Map<String, Value>,
}

impl AnnotatedObject {
    /// Creates a vector object; mostly useful in tests and fixtures.
    pub fn with_points(id: ObjectId, kind: GeometryKind, points: Points) -> Self {
        Self {
            id,
            kind,
            class_title: String::new(),
            geometry: Geometry::Points(points),
            tags: Vec::new(),
            author: None,
            extra: Map::new(),
        }
    }

    pub fn points(&self) -> Option<&Points> {
        self.geometry.as_points()
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t.name == name)
    }

    /// Serializes back to the platform's object JSON.
    pub fn to_json(&self) -> Value {
        let mut obj = self.extra.clone();
        obj.insert("id".to_string(), Value::from(self.id));
        obj.insert("classTitle".to_string(), Value::from(self.class_title.clone()));
        obj.insert("geometryType".to_string(), Value::from(self.kind.as_str()));
        let (field, value) = self.geometry.to_json_field();
        obj.insert(field.to_string(), value);
        obj.insert(
            "tags".to_string(),
            serde_json::to_value(&self.tags).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        if let Some(author) = &self.author {
            obj.insert("labelerLogin".to_string(), Value::from(author.clone()));
        }
        Value::Object(obj)
    }
}

/// An object whose JSON could not be decoded against the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct UndecodableObject {
    pub id: Option<ObjectId>,
    pub kind: Option<GeometryKind>,
    pub reason: String,
    pub raw: Value,
}

/// Entry of an annotation's object list.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEntry {
    Decoded(AnnotatedObject),
    Undecodable(UndecodableObject),
}

impl ObjectEntry {
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            ObjectEntry::Decoded(obj) => Some(obj.id),
            ObjectEntry::Undecodable(raw) => raw.id,
        }
    }

    pub fn kind(&self) -> Option<&GeometryKind> {
        match self {
            ObjectEntry::Decoded(obj) => Some(&obj.kind),
            ObjectEntry::Undecodable(raw) => raw.kind.as_ref(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ObjectEntry::Decoded(obj) => obj.to_json(),
            ObjectEntry::Undecodable(raw) => raw.raw.clone(),
        }
    }
}

/// Annotation JSON for one image, as returned by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAnnotation {
    pub image_id: ImageId,
    pub json: Value,
}

impl RawAnnotation {
    pub fn new(image_id: ImageId, json: Value) -> Self {
        Self { image_id, json }
    }
}

/// Decoded annotation of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub image_id: ImageId,
    pub objects: Vec<ObjectEntry>,
    pub tags: Vec<Tag>,
    pub extra: Map<String, Value>,
}

impl Annotation {
    pub fn new(image_id: ImageId, objects: Vec<ObjectEntry>) -> Self {
        Self {
            image_id,
            objects,
            tags: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn decoded_objects(&self) -> impl Iterator<Item = &AnnotatedObject> {
        self.objects.iter().filter_map(|entry| match entry {
            ObjectEntry::Decoded(obj) => Some(obj),
            ObjectEntry::Undecodable(_) => None,
        })
    }

    /// Serializes back to the platform's annotation JSON.
    pub fn to_json(&self) -> Value {
        let mut ann = self.extra.clone();
        ann.insert(
            "objects".to_string(),
            Value::Array(self.objects.iter().map(ObjectEntry::to_json).collect()),
        );
        ann.insert(
            "tags".to_string(),
            serde_json::to_value(&self.tags).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        Value::Object(ann)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_kind_parse_aliases() {
        assert_eq!(GeometryKind::parse("polygon"), GeometryKind::Polygon);
        assert_eq!(GeometryKind::parse("line"), GeometryKind::Polyline);
        assert_eq!(GeometryKind::parse("Polyline"), GeometryKind::Polyline);
        assert_eq!(GeometryKind::parse("graph"), GeometryKind::GraphNodes);
        assert_eq!(
            GeometryKind::parse("cuboid"),
            GeometryKind::Other("cuboid".to_string())
        );
    }

    #[test]
    fn test_geometry_kind_serde() {
        let json = serde_json::to_string(&GeometryKind::Polyline).unwrap();
        assert_eq!(json, "\"line\"");
        let kind: GeometryKind = serde_json::from_str("\"bitmap\"").unwrap();
        assert_eq!(kind, GeometryKind::Bitmap);
    }

    #[test]
    fn test_object_to_json_keeps_extra_fields() {
        let mut obj = AnnotatedObject::with_points(
            7,
            GeometryKind::Polygon,
            Points::new(vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]),
        );
        obj.class_title = "car".to_string();
        obj.extra
            .insert("classId".to_string(), Value::from(12));

        let json = obj.to_json();
        assert_eq!(json["id"], 7);
        assert_eq!(json["classId"], 12);
        assert_eq!(json["geometryType"], "polygon");
        assert_eq!(json["points"]["exterior"].as_array().unwrap().len(), 3);
    }
}
