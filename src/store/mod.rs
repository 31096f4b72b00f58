//! Source and destination store interfaces.
//!
//! The pipeline talks to stores only through [`SourceStore`] and
//! [`DestinationStore`]. Annotations are read back from the destination
//! after images are copied, so a destination is itself a readable store
//! and object ids in outgoing work always refer to destination objects.
//!
//! Implementations:
//! - [`MemoryStore`]: in-process platform model with fault injection
//! - [`local`]: loads and saves projects in the on-disk project layout

pub mod local;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::annotation::{
    Annotation, ContainerId, Geometry, ImageId, ObjectId, ProjectId, RawAnnotation, Tag,
    TagDescriptor,
};
use crate::error::StoreError;
use crate::validation::TagAssignment;

pub use memory::{MemoryStore, StoreOperation};
pub use retry::{with_retry, RetryPolicy};

/// Project summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: String,
}

/// Container (dataset) summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: ContainerId,
    pub project_id: ProjectId,
    pub name: String,
    pub parent_id: Option<ContainerId>,
    pub images_count: usize,
}

/// A container and its nested containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerNode {
    pub info: ContainerInfo,
    pub children: Vec<ContainerNode>,
}

impl ContainerNode {
    pub fn leaf(info: ContainerInfo) -> Self {
        Self {
            info,
            children: Vec::new(),
        }
    }

    /// Finds the node with the given id anywhere below (or at) this node.
    pub fn find(&self, id: ContainerId) -> Option<&ContainerNode> {
        if self.info.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    /// Number of containers in this subtree, including this one.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(ContainerNode::count).sum::<usize>()
    }
}

/// Finds a subtree across a forest of root containers.
pub fn find_subtree(roots: &[ContainerNode], id: ContainerId) -> Option<&ContainerNode> {
    roots.iter().find_map(|root| root.find(id))
}

/// Image summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: ImageId,
    pub name: String,
    pub container_id: ContainerId,
}

/// Image created in the destination by a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestImage {
    pub source_id: ImageId,
    pub id: ImageId,
    pub name: String,
}

/// Read access to a store.
#[async_trait]
pub trait SourceStore: Send + Sync {
    async fn project_info(&self, project: ProjectId) -> Result<ProjectInfo, StoreError>;

    /// Project meta (class and tag definitions) as native JSON.
    async fn project_meta(&self, project: ProjectId) -> Result<Value, StoreError>;

    /// Root containers of a project with their nested containers.
    async fn list_container_tree(
        &self,
        project: ProjectId,
    ) -> Result<Vec<ContainerNode>, StoreError>;

    /// Pages of a container's images, in id order.
    fn list_images_paged(
        &self,
        container: ContainerId,
        page_size: usize,
    ) -> BoxStream<'_, Result<Vec<ImageInfo>, StoreError>>;

    /// Annotation JSON of the given images, in the order requested.
    async fn download_annotations(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
    ) -> Result<Vec<RawAnnotation>, StoreError>;
}

/// Write access to a store. Destinations are readable too.
#[async_trait]
pub trait DestinationStore: SourceStore {
    /// Creates a project, renaming on conflict.
    async fn create_project(&self, name: &str, meta: &Value) -> Result<ProjectInfo, StoreError>;

    /// Adds the review tag definition to the project meta if missing.
    async fn ensure_tag_meta(
        &self,
        project: ProjectId,
        tag: &TagDescriptor,
    ) -> Result<(), StoreError>;

    async fn create_container(
        &self,
        project: ProjectId,
        name: &str,
        parent: Option<ContainerId>,
    ) -> Result<ContainerInfo, StoreError>;

    /// Copies images with their annotations into `dst`.
    async fn copy_or_link_images(
        &self,
        src: ContainerId,
        images: &[ImageInfo],
        dst: ContainerId,
    ) -> Result<Vec<DestImage>, StoreError>;

    /// Replaces whole annotations.
    async fn upload_annotations(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
        annotations: &[Annotation],
    ) -> Result<(), StoreError>;

    async fn add_tag_to_objects(
        &self,
        container: ContainerId,
        assignments: &[TagAssignment],
    ) -> Result<(), StoreError>;

    async fn add_tag_to_images(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
        tag: &Tag,
    ) -> Result<(), StoreError>;

    async fn replace_object_geometries(
        &self,
        object_ids: &[ObjectId],
        geometries: &[Geometry],
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: ContainerId, parent_id: Option<ContainerId>) -> ContainerInfo {
        ContainerInfo {
            id,
            project_id: 1,
            name: format!("ds{}", id),
            parent_id,
            images_count: 0,
        }
    }

    #[test]
    fn test_find_subtree_searches_every_branch() {
        let roots = vec![
            ContainerNode {
                info: info(1, None),
                children: vec![ContainerNode::leaf(info(2, Some(1)))],
            },
            ContainerNode {
                info: info(3, None),
                children: vec![ContainerNode {
                    info: info(4, Some(3)),
                    children: vec![ContainerNode::leaf(info(5, Some(4)))],
                }],
            },
        ];

        assert_eq!(find_subtree(&roots, 5).map(|n| n.info.id), Some(5));
        assert_eq!(find_subtree(&roots, 4).map(ContainerNode::count), Some(2));
        assert!(find_subtree(&roots, 9).is_none());
    }
}
