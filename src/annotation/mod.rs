//! Annotation model and decoding.
//!
//! - [`types`]: images, objects, geometries and tags
//! - [`decode`]: native annotation JSON to [`Annotation`]

pub mod decode;
pub mod types;

pub use decode::{decode_object, DecodeError};
pub use types::{
    AnnotatedObject, Annotation, BitmapRef, ContainerId, Geometry, GeometryKind, ImageId,
    ObjectEntry, ObjectId, Point, Points, ProjectId, RawAnnotation, Tag, TagDescriptor,
    UndecodableObject,
};
