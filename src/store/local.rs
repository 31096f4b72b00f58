//! Projects in the platform's local directory layout.
//!
//! ```text
//! <project>/
//!   meta.json
//!   <dataset>/
//!     ann/<image name>.json
//!     img/<image name>          (optional)
//!     datasets/<nested dataset>/...
//! ```
//!
//! [`load_project`] reads such a directory into a [`MemoryStore`];
//! [`save_project`] writes a project of that store back out.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tokio::fs;
use walkdir::WalkDir;

use crate::annotation::{ContainerId, ProjectId};
use crate::error::StoreError;

use super::{MemoryStore, SourceStore};

pub const META_FILE: &str = "meta.json";
const ANN_DIR: &str = "ann";
const IMG_DIR: &str = "img";
const NESTED_DIR: &str = "datasets";

/// Dataset names along a dataset directory path relative to the project
/// root, or `None` when the path is not a dataset directory.
///
/// `a` is dataset `a`; `a/datasets/b` is dataset `b` nested in `a`.
fn dataset_chain(rel: &Path) -> Option<Vec<String>> {
    let parts: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.len() % 2 == 0 {
        return None;
    }
    let mut chain = Vec::with_capacity(parts.len() / 2 + 1);
    for (i, part) in parts.into_iter().enumerate() {
        if i % 2 == 1 {
            if part != NESTED_DIR {
                return None;
            }
        } else {
            chain.push(part);
        }
    }
    Some(chain)
}

/// Loads a project directory into a fresh store.
pub async fn load_project(dir: &Path) -> Result<(MemoryStore, ProjectId), StoreError> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            StoreError::InvalidRequest(format!("not a project directory: {}", dir.display()))
        })?;

    let meta_path = dir.join(META_FILE);
    let meta: Value = serde_json::from_str(&fs::read_to_string(&meta_path).await?)?;

    let store = MemoryStore::new();
    let project = store.add_project(&name);
    store.set_project_meta(project, meta);

    let mut containers: HashMap<Vec<String>, ContainerId> = HashMap::new();
    let mut ann_files: Vec<(Vec<String>, PathBuf)> = Vec::new();

    // Sorted traversal visits parents before their nested datasets.
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                continue;
            }
        };
        let Ok(rel) = entry.path().strip_prefix(dir) else {
            continue;
        };

        if entry.file_type().is_dir() {
            let Some(chain) = dataset_chain(rel) else {
                continue;
            };
            let parent = containers.get(&chain[..chain.len() - 1]).copied();
            let dataset_name = chain.last().cloned().unwrap_or_default();
            let id = store.add_container(project, &dataset_name, parent);
            containers.insert(chain, id);
        } else if entry.path().extension().is_some_and(|ext| ext == "json") {
            let Some(ann_dir) = rel.parent() else {
                continue;
            };
            if ann_dir.file_name().map_or(true, |n| n != ANN_DIR) {
                continue;
            }
            if let Some(chain) = ann_dir.parent().and_then(dataset_chain) {
                ann_files.push((chain, entry.path().to_path_buf()));
            }
        }
    }

    for (chain, path) in ann_files {
        let Some(&container) = containers.get(&chain) else {
            continue;
        };
        let image_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let annotation: Value = serde_json::from_str(&fs::read_to_string(&path).await?)?;

        let file = path
            .parent()
            .and_then(Path::parent)
            .map(|ds| ds.join(IMG_DIR).join(&image_name))
            .filter(|p| p.is_file());
        store.insert_image(container, &image_name, annotation, file);
    }

    tracing::info!(
        project = %name,
        datasets = containers.len(),
        images = store.project_image_count(project),
        "Loaded project"
    );
    Ok((store, project))
}

/// Writes a project of `store` under `out_dir/<project name>` and returns
/// the project directory.
pub async fn save_project(
    store: &MemoryStore,
    project: ProjectId,
    out_dir: &Path,
) -> Result<PathBuf, StoreError> {
    let info = store.project_info(project).await?;
    let meta = store.project_meta(project).await?;
    let root = out_dir.join(&info.name);

    fs::create_dir_all(&root).await?;
    fs::write(root.join(META_FILE), serde_json::to_string_pretty(&meta)?).await?;

    let mut stack: Vec<_> = store
        .list_container_tree(project)
        .await?
        .into_iter()
        .map(|node| {
            let ds_dir = root.join(&node.info.name);
            (node, ds_dir)
        })
        .collect();

    while let Some((node, ds_dir)) = stack.pop() {
        let ann_dir = ds_dir.join(ANN_DIR);
        fs::create_dir_all(&ann_dir).await?;

        for record in store.image_records_in(node.info.id) {
            let ann_path = ann_dir.join(format!("{}.json", record.info.name));
            fs::write(&ann_path, serde_json::to_string_pretty(&record.annotation)?).await?;
            if let Some(src) = &record.file {
                let img_dir = ds_dir.join(IMG_DIR);
                fs::create_dir_all(&img_dir).await?;
                fs::copy(src, img_dir.join(&record.info.name)).await?;
            }
        }

        let nested = ds_dir.join(NESTED_DIR);
        for child in node.children {
            let child_dir = nested.join(&child.info.name);
            stack.push((child, child_dir));
        }
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_json(path: &Path, value: &Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string(value).unwrap()).unwrap();
    }

    #[test]
    fn test_dataset_chain() {
        assert_eq!(dataset_chain(Path::new("a")), Some(vec!["a".to_string()]));
        assert_eq!(
            dataset_chain(Path::new("a/datasets/b")),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(dataset_chain(Path::new("a/ann")), None);
        assert_eq!(dataset_chain(Path::new("a/img/x")), None);
    }

    #[tokio::test]
    async fn test_load_nested_project() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("roads");
        write_json(&dir.join(META_FILE), &json!({"classes": [], "tags": []}));
        write_json(
            &dir.join("city/ann/1.jpg.json"),
            &json!({"tags": [], "objects": []}),
        );
        write_json(
            &dir.join("city/datasets/north/ann/2.jpg.json"),
            &json!({"tags": [], "objects": []}),
        );

        let (store, project) = load_project(&dir).await.unwrap();
        assert_eq!(store.project_info(project).await.unwrap().name, "roads");

        let tree = store.list_container_tree(project).await.unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].info.name, "city");
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].info.name, "north");

        let images = store.images_in(tree[0].children[0].info.id);
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].name, "2.jpg");
    }

    #[tokio::test]
    async fn test_save_writes_local_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let project = store.add_project("roads_validated");
        let city = store.add_container(project, "city", None);
        let north = store.add_container(project, "north", Some(city));
        store.add_image(north, "2.jpg", json!({"tags": [], "objects": []}));

        let root = save_project(&store, project, tmp.path()).await.unwrap();
        assert!(root.join(META_FILE).is_file());
        assert!(root.join("city/ann").is_dir());
        assert!(root.join("city/datasets/north/ann/2.jpg.json").is_file());
    }
}
