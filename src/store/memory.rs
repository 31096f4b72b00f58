//! In-process store modelling the annotation platform.
//!
//! Holds projects, containers, images and annotation JSON behind a mutex.
//! Copying images assigns fresh image and object ids, like the platform
//! does. Failures can be injected per operation to exercise retry and
//! abort paths, and call counters record how often each operation ran.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};

use crate::annotation::{
    Annotation, ContainerId, Geometry, ImageId, ObjectId, ProjectId, RawAnnotation, Tag,
    TagDescriptor,
};
use crate::error::StoreError;
use crate::validation::TagAssignment;

use super::{
    ContainerInfo, ContainerNode, DestImage, DestinationStore, ImageInfo, ProjectInfo,
    SourceStore,
};

/// Store operations that can be counted or made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    ListImages,
    DownloadAnnotations,
    CreateContainer,
    CopyImages,
    UploadAnnotations,
    AddTagToObjects,
    AddTagToImages,
    ReplaceGeometries,
}

#[derive(Debug, Clone)]
struct ProjectRecord {
    info: ProjectInfo,
    meta: Value,
}

#[derive(Debug, Clone)]
pub(crate) struct ImageRecord {
    pub(crate) info: ImageInfo,
    pub(crate) annotation: Value,
    /// Location of the image file, when the store was loaded from disk.
    pub(crate) file: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    projects: BTreeMap<ProjectId, ProjectRecord>,
    containers: BTreeMap<ContainerId, ContainerInfo>,
    images: BTreeMap<ImageId, ImageRecord>,
    objects: HashMap<ObjectId, ImageId>,
    faults: HashMap<StoreOperation, VecDeque<StoreError>>,
    calls: HashMap<StoreOperation, usize>,
    downloads_per_image: HashMap<ImageId, usize>,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn enter(&mut self, op: StoreOperation) -> Result<(), StoreError> {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn container(&self, id: ContainerId) -> Result<&ContainerInfo, StoreError> {
        self.containers.get(&id).ok_or(StoreError::NotFound {
            entity: "container",
            id,
        })
    }

    /// Gives every object of an annotation an id, keeping existing ones
    /// unless `fresh` is set, and indexes them under `image_id`.
    fn index_objects(&mut self, image_id: ImageId, annotation: &mut Value, fresh: bool) {
        let Some(objects) = annotation.get_mut("objects").and_then(Value::as_array_mut) else {
            return;
        };
        let mut assigned = Vec::with_capacity(objects.len());
        for obj in objects.iter_mut() {
            let Some(map) = obj.as_object_mut() else {
                continue;
            };
            let id = match map.get("id").and_then(Value::as_u64) {
                Some(id) if !fresh => id,
                _ => {
                    self.next_id += 1;
                    self.next_id
                }
            };
            map.insert("id".to_string(), json!(id));
            assigned.push(id);
        }
        for id in assigned {
            self.next_id = self.next_id.max(id);
            self.objects.insert(id, image_id);
        }
    }

    fn unindex_objects(&mut self, image_id: ImageId) {
        self.objects.retain(|_, image| *image != image_id);
    }

    fn object_mut(&mut self, object_id: ObjectId) -> Result<&mut Value, StoreError> {
        let image_id = *self.objects.get(&object_id).ok_or(StoreError::NotFound {
            entity: "object",
            id: object_id,
        })?;
        self.images
            .get_mut(&image_id)
            .and_then(|record| record.annotation.get_mut("objects"))
            .and_then(Value::as_array_mut)
            .and_then(|objects| {
                objects
                    .iter_mut()
                    .find(|obj| obj.get("id").and_then(Value::as_u64) == Some(object_id))
            })
            .ok_or(StoreError::NotFound {
                entity: "object",
                id: object_id,
            })
    }

    fn project_has_tag(&self, project: ProjectId, name: &str) -> bool {
        self.projects
            .get(&project)
            .and_then(|p| p.meta.get("tags"))
            .and_then(Value::as_array)
            .map(|tags| tags.iter().any(|t| t.get("name").and_then(Value::as_str) == Some(name)))
            .unwrap_or(false)
    }

    fn check_tag(&self, container: ContainerId, tag_name: &str) -> Result<(), StoreError> {
        let project = self.container(container)?.project_id;
        if self.project_has_tag(project, tag_name) {
            Ok(())
        } else {
            Err(StoreError::InvalidRequest(format!(
                "tag '{}' is not defined in project {}",
                tag_name, project
            )))
        }
    }
}

fn push_tag(target: &mut Value, tag: &Tag) {
    let tag_json = json!({"name": tag.name, "value": tag.value});
    match target.get_mut("tags").and_then(Value::as_array_mut) {
        Some(tags) => tags.push(tag_json),
        None => {
            if let Some(map) = target.as_object_mut() {
                map.insert("tags".to_string(), Value::Array(vec![tag_json]));
            }
        }
    }
}

/// In-memory platform store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
    in_flight_downloads: AtomicUsize,
    max_in_flight_downloads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an artificial delay to every download and write call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn add_project(&self, name: &str) -> ProjectId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.projects.insert(
            id,
            ProjectRecord {
                info: ProjectInfo {
                    id,
                    name: name.to_string(),
                },
                meta: json!({"classes": [], "tags": []}),
            },
        );
        id
    }

    pub fn set_project_meta(&self, project: ProjectId, meta: Value) {
        if let Some(record) = self.lock().projects.get_mut(&project) {
            record.meta = meta;
        }
    }

    pub fn add_container(
        &self,
        project: ProjectId,
        name: &str,
        parent: Option<ContainerId>,
    ) -> ContainerId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.containers.insert(
            id,
            ContainerInfo {
                id,
                project_id: project,
                name: name.to_string(),
                parent_id: parent,
                images_count: 0,
            },
        );
        id
    }

    /// Adds an image with its annotation JSON. Objects without an id get one.
    pub fn add_image(&self, container: ContainerId, name: &str, annotation: Value) -> ImageId {
        self.insert_image(container, name, annotation, None)
    }

    pub(crate) fn insert_image(
        &self,
        container: ContainerId,
        name: &str,
        mut annotation: Value,
        file: Option<PathBuf>,
    ) -> ImageId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.index_objects(id, &mut annotation, false);
        if let Some(info) = state.containers.get_mut(&container) {
            info.images_count += 1;
        }
        state.images.insert(
            id,
            ImageRecord {
                info: ImageInfo {
                    id,
                    name: name.to_string(),
                    container_id: container,
                },
                annotation,
                file,
            },
        );
        id
    }

    /// Queues an error returned by the next call of `op`.
    pub fn inject_fault(&self, op: StoreOperation, err: StoreError) {
        self.lock().faults.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: StoreOperation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// How many times the annotation of an image was downloaded.
    pub fn downloads_of(&self, image: ImageId) -> usize {
        self.lock()
            .downloads_per_image
            .get(&image)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of concurrent download calls observed.
    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_in_flight_downloads.load(Ordering::SeqCst)
    }

    pub fn annotation(&self, image: ImageId) -> Option<Value> {
        self.lock().images.get(&image).map(|r| r.annotation.clone())
    }

    pub fn images_in(&self, container: ContainerId) -> Vec<ImageInfo> {
        self.lock()
            .images
            .values()
            .filter(|r| r.info.container_id == container)
            .map(|r| r.info.clone())
            .collect()
    }

    pub fn containers_of(&self, project: ProjectId) -> Vec<ContainerInfo> {
        self.lock()
            .containers
            .values()
            .filter(|c| c.project_id == project)
            .cloned()
            .collect()
    }

    /// Number of images across all containers of a project.
    pub fn project_image_count(&self, project: ProjectId) -> usize {
        let state = self.lock();
        state
            .images
            .values()
            .filter(|r| {
                state
                    .containers
                    .get(&r.info.container_id)
                    .is_some_and(|c| c.project_id == project)
            })
            .count()
    }

    pub fn projects(&self) -> Vec<ProjectInfo> {
        self.lock().projects.values().map(|p| p.info.clone()).collect()
    }

    pub(crate) fn image_records_in(&self, container: ContainerId) -> Vec<ImageRecord> {
        self.lock()
            .images
            .values()
            .filter(|r| r.info.container_id == container)
            .cloned()
            .collect()
    }

    fn build_tree(state: &State, project: ProjectId, parent: Option<ContainerId>) -> Vec<ContainerNode> {
        state
            .containers
            .values()
            .filter(|c| c.project_id == project && c.parent_id == parent)
            .map(|c| ContainerNode {
                info: c.clone(),
                children: Self::build_tree(state, project, Some(c.id)),
            })
            .collect()
    }
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn project_info(&self, project: ProjectId) -> Result<ProjectInfo, StoreError> {
        self.lock()
            .projects
            .get(&project)
            .map(|p| p.info.clone())
            .ok_or(StoreError::NotFound {
                entity: "project",
                id: project,
            })
    }

    async fn project_meta(&self, project: ProjectId) -> Result<Value, StoreError> {
        self.lock()
            .projects
            .get(&project)
            .map(|p| p.meta.clone())
            .ok_or(StoreError::NotFound {
                entity: "project",
                id: project,
            })
    }

    async fn list_container_tree(
        &self,
        project: ProjectId,
    ) -> Result<Vec<ContainerNode>, StoreError> {
        let state = self.lock();
        if !state.projects.contains_key(&project) {
            return Err(StoreError::NotFound {
                entity: "project",
                id: project,
            });
        }
        Ok(Self::build_tree(&state, project, None))
    }

    fn list_images_paged(
        &self,
        container: ContainerId,
        page_size: usize,
    ) -> BoxStream<'_, Result<Vec<ImageInfo>, StoreError>> {
        let page_size = page_size.max(1);
        Box::pin(async_stream::stream! {
            let mut after: Option<ImageId> = None;
            loop {
                let page = {
                    let mut state = self.lock();
                    if let Err(err) = state.enter(StoreOperation::ListImages) {
                        Err(err)
                    } else if let Err(err) = state.container(container) {
                        Err(err)
                    } else {
                        Ok(state
                            .images
                            .values()
                            .filter(|r| r.info.container_id == container)
                            .filter(|r| after.map_or(true, |a| r.info.id > a))
                            .take(page_size)
                            .map(|r| r.info.clone())
                            .collect::<Vec<_>>())
                    }
                };
                match page {
                    Ok(page) if page.is_empty() => break,
                    Ok(page) => {
                        let full = page.len() == page_size;
                        after = page.last().map(|i| i.id);
                        yield Ok(page);
                        if !full {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        })
    }

    async fn download_annotations(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
    ) -> Result<Vec<RawAnnotation>, StoreError> {
        self.lock().enter(StoreOperation::DownloadAnnotations)?;

        let in_flight = self.in_flight_downloads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_downloads
            .fetch_max(in_flight, Ordering::SeqCst);
        self.simulate_latency().await;
        self.in_flight_downloads.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.lock();
        state.container(container)?;
        let mut out = Vec::with_capacity(image_ids.len());
        for &id in image_ids {
            let record = state
                .images
                .get(&id)
                .filter(|r| r.info.container_id == container)
                .ok_or(StoreError::NotFound { entity: "image", id })?;
            out.push(RawAnnotation::new(id, record.annotation.clone()));
        }
        for &id in image_ids {
            *state.downloads_per_image.entry(id).or_default() += 1;
        }
        Ok(out)
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn create_project(&self, name: &str, meta: &Value) -> Result<ProjectInfo, StoreError> {
        let mut state = self.lock();
        let mut unique = name.to_string();
        let mut suffix = 1;
        while state.projects.values().any(|p| p.info.name == unique) {
            unique = format!("{}_{:03}", name, suffix);
            suffix += 1;
        }

        let id = state.allocate_id();
        let info = ProjectInfo { id, name: unique };
        state.projects.insert(
            id,
            ProjectRecord {
                info: info.clone(),
                meta: meta.clone(),
            },
        );
        Ok(info)
    }

    async fn ensure_tag_meta(
        &self,
        project: ProjectId,
        tag: &TagDescriptor,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.project_has_tag(project, &tag.name) {
            return Ok(());
        }
        let record = state.projects.get_mut(&project).ok_or(StoreError::NotFound {
            entity: "project",
            id: project,
        })?;
        let tag_json = json!({"name": tag.name, "value_type": "none"});
        match record.meta.get_mut("tags").and_then(Value::as_array_mut) {
            Some(tags) => tags.push(tag_json),
            None => {
                if let Some(meta) = record.meta.as_object_mut() {
                    meta.insert("tags".to_string(), Value::Array(vec![tag_json]));
                }
            }
        }
        Ok(())
    }

    async fn create_container(
        &self,
        project: ProjectId,
        name: &str,
        parent: Option<ContainerId>,
    ) -> Result<ContainerInfo, StoreError> {
        let mut state = self.lock();
        state.enter(StoreOperation::CreateContainer)?;
        if !state.projects.contains_key(&project) {
            return Err(StoreError::NotFound {
                entity: "project",
                id: project,
            });
        }
        if let Some(parent) = parent {
            state.container(parent)?;
        }
        let id = state.allocate_id();
        let info = ContainerInfo {
            id,
            project_id: project,
            name: name.to_string(),
            parent_id: parent,
            images_count: 0,
        };
        state.containers.insert(id, info.clone());
        Ok(info)
    }

    async fn copy_or_link_images(
        &self,
        src: ContainerId,
        images: &[ImageInfo],
        dst: ContainerId,
    ) -> Result<Vec<DestImage>, StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.enter(StoreOperation::CopyImages)?;
        state.container(src)?;
        state.container(dst)?;

        let mut copied = Vec::with_capacity(images.len());
        for image in images {
            let source = state
                .images
                .get(&image.id)
                .filter(|r| r.info.container_id == src)
                .cloned()
                .ok_or(StoreError::NotFound {
                    entity: "image",
                    id: image.id,
                })?;

            let id = state.allocate_id();
            let mut annotation = source.annotation.clone();
            state.index_objects(id, &mut annotation, true);
            state.images.insert(
                id,
                ImageRecord {
                    info: ImageInfo {
                        id,
                        name: source.info.name.clone(),
                        container_id: dst,
                    },
                    annotation,
                    file: source.file.clone(),
                },
            );
            copied.push(DestImage {
                source_id: image.id,
                id,
                name: source.info.name,
            });
        }
        if let Some(info) = state.containers.get_mut(&dst) {
            info.images_count += copied.len();
        }
        Ok(copied)
    }

    async fn upload_annotations(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
        annotations: &[Annotation],
    ) -> Result<(), StoreError> {
        if image_ids.len() != annotations.len() {
            return Err(StoreError::InvalidRequest(format!(
                "{} image ids for {} annotations",
                image_ids.len(),
                annotations.len()
            )));
        }
        self.simulate_latency().await;
        let mut state = self.lock();
        state.enter(StoreOperation::UploadAnnotations)?;
        state.container(container)?;

        for (&image_id, annotation) in image_ids.iter().zip(annotations) {
            if !state
                .images
                .get(&image_id)
                .is_some_and(|r| r.info.container_id == container)
            {
                return Err(StoreError::NotFound {
                    entity: "image",
                    id: image_id,
                });
            }
            let mut json = annotation.to_json();
            state.unindex_objects(image_id);
            state.index_objects(image_id, &mut json, false);
            if let Some(record) = state.images.get_mut(&image_id) {
                record.annotation = json;
            }
        }
        Ok(())
    }

    async fn add_tag_to_objects(
        &self,
        container: ContainerId,
        assignments: &[TagAssignment],
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.enter(StoreOperation::AddTagToObjects)?;
        for assignment in assignments {
            state.check_tag(container, &assignment.tag.name)?;
            let obj = state.object_mut(assignment.object_id)?;
            push_tag(obj, &assignment.tag);
        }
        Ok(())
    }

    async fn add_tag_to_images(
        &self,
        container: ContainerId,
        image_ids: &[ImageId],
        tag: &Tag,
    ) -> Result<(), StoreError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        state.enter(StoreOperation::AddTagToImages)?;
        state.check_tag(container, &tag.name)?;
        for &image_id in image_ids {
            let record = state
                .images
                .get_mut(&image_id)
                .filter(|r| r.info.container_id == container)
                .ok_or(StoreError::NotFound {
                    entity: "image",
                    id: image_id,
                })?;
            push_tag(&mut record.annotation, tag);
        }
        Ok(())
    }

    async fn replace_object_geometries(
        &self,
        object_ids: &[ObjectId],
        geometries: &[Geometry],
    ) -> Result<(), StoreError> {
        if object_ids.len() != geometries.len() {
            return Err(StoreError::InvalidRequest(format!(
                "{} object ids for {} geometries",
                object_ids.len(),
                geometries.len()
            )));
        }
        self.simulate_latency().await;
        let mut state = self.lock();
        state.enter(StoreOperation::ReplaceGeometries)?;
        for (&object_id, geometry) in object_ids.iter().zip(geometries) {
            let obj = state.object_mut(object_id)?;
            let (field, value) = geometry.to_json_field();
            if let Some(map) = obj.as_object_mut() {
                map.insert(field.to_string(), value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn polygon_ann() -> Value {
        json!({
            "tags": [],
            "objects": [{
                "classTitle": "lake",
                "geometryType": "polygon",
                "points": {"exterior": [[0, 0], [1, 1]], "interior": []},
                "tags": []
            }]
        })
    }

    #[tokio::test]
    async fn test_copy_assigns_fresh_object_ids() {
        let store = MemoryStore::new();
        let project = store.add_project("p");
        let src = store.add_container(project, "a", None);
        let dst = store.add_container(project, "b", None);
        let image = store.add_image(src, "1.jpg", polygon_ann());

        let infos = store.images_in(src);
        let copied = store.copy_or_link_images(src, &infos, dst).await.unwrap();
        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].source_id, image);

        let src_id = store.annotation(image).unwrap()["objects"][0]["id"].clone();
        let dst_id = store.annotation(copied[0].id).unwrap()["objects"][0]["id"].clone();
        assert_ne!(src_id, dst_id);
    }

    #[tokio::test]
    async fn test_paged_listing() {
        let store = MemoryStore::new();
        let project = store.add_project("p");
        let ds = store.add_container(project, "a", None);
        for i in 0..5 {
            store.add_image(ds, &format!("{}.jpg", i), json!({"objects": []}));
        }

        let pages: Vec<_> = store.list_images_paged(ds, 2).collect().await;
        let sizes: Vec<usize> = pages.into_iter().map(|p| p.unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let store = MemoryStore::new();
        let project = store.add_project("p");
        let ds = store.add_container(project, "a", None);
        let image = store.add_image(ds, "1.jpg", json!({"objects": []}));

        store.inject_fault(
            StoreOperation::DownloadAnnotations,
            StoreError::Timeout("injected".into()),
        );
        assert!(store.download_annotations(ds, &[image]).await.is_err());
        assert!(store.download_annotations(ds, &[image]).await.is_ok());
        assert_eq!(store.calls(StoreOperation::DownloadAnnotations), 2);
        assert_eq!(store.downloads_of(image), 1);
    }

    #[tokio::test]
    async fn test_tagging_requires_tag_meta() {
        let store = MemoryStore::new();
        let project = store.add_project("p");
        let ds = store.add_container(project, "a", None);
        let image = store.add_image(ds, "1.jpg", polygon_ann());
        let object_id = store.annotation(image).unwrap()["objects"][0]["id"]
            .as_u64()
            .unwrap();
        let assignment = TagAssignment {
            image_id: image,
            object_id,
            tag: Tag::named("review"),
        };

        let err = store
            .add_tag_to_objects(ds, std::slice::from_ref(&assignment))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRequest(_)));

        store
            .ensure_tag_meta(project, &TagDescriptor::new("review"))
            .await
            .unwrap();
        store.add_tag_to_objects(ds, &[assignment]).await.unwrap();
        let ann = store.annotation(image).unwrap();
        assert_eq!(ann["objects"][0]["tags"][0]["name"], "review");
    }

    #[tokio::test]
    async fn test_create_project_renames_on_conflict() {
        let store = MemoryStore::new();
        store.add_project("data_validated");
        let info = store
            .create_project("data_validated", &json!({}))
            .await
            .unwrap();
        assert_eq!(info.name, "data_validated_001");
    }
}
