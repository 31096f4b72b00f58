//! End-to-end migrations against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use annotation_validator::annotation::{ContainerId, ImageId, ProjectId};
use annotation_validator::error::{ErrorClass, MigrationError, StoreError};
use annotation_validator::pipeline::{
    MigrationConfig, MigrationReport, RecordingProgress, RunConfig, RunMode, TreeOrchestrator,
};
use annotation_validator::rules::RuleConfig;
use annotation_validator::store::{MemoryStore, RetryPolicy, StoreOperation};
use serde_json::{json, Value};

fn polygon(exterior: Value) -> Value {
    json!({
        "classTitle": "field",
        "geometryType": "polygon",
        "points": {"exterior": exterior, "interior": []},
        "tags": []
    })
}

fn rectangle(exterior: Value) -> Value {
    json!({
        "classTitle": "car",
        "geometryType": "rectangle",
        "points": {"exterior": exterior, "interior": []},
        "tags": []
    })
}

fn polyline(exterior: Value) -> Value {
    json!({
        "classTitle": "road",
        "geometryType": "line",
        "points": {"exterior": exterior, "interior": []},
        "tags": []
    })
}

/// Project "roads" with one dataset:
/// - `1.jpg`: A (two-vertex polygon) and B (rectangle)
/// - `2.jpg`: C (single-point polyline)
/// - `3.jpg`: a valid polyline
struct Fixture {
    store: Arc<MemoryStore>,
    progress: Arc<RecordingProgress>,
    project: ProjectId,
    dataset: ContainerId,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let project = store.add_project("roads");
    let dataset = store.add_container(project, "city", None);
    store.add_image(
        dataset,
        "1.jpg",
        json!({
            "tags": [],
            "objects": [
                polygon(json!([[0.0, 0.0], [4.0, 0.0]])),
                rectangle(json!([[1.0, 1.0], [3.0, 2.0]])),
            ]
        }),
    );
    store.add_image(
        dataset,
        "2.jpg",
        json!({"tags": [], "objects": [polyline(json!([[5.0, 5.0]]))]}),
    );
    store.add_image(
        dataset,
        "3.jpg",
        json!({"tags": [], "objects": [polyline(json!([[0.0, 0.0], [9.0, 9.0]]))]}),
    );
    Fixture {
        store,
        progress: Arc::new(RecordingProgress::new()),
        project,
        dataset,
    }
}

fn config() -> MigrationConfig {
    MigrationConfig::default()
        .with_page_size(2)
        .with_batch_size(1)
        .with_download_workers(2)
        .with_upload_workers(2)
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
}

async fn migrate(
    f: &Fixture,
    config: MigrationConfig,
    mode: RunMode,
) -> Result<MigrationReport, MigrationError> {
    TreeOrchestrator::new(f.store.clone(), f.store.clone(), config, f.progress.clone())?
        .run(&RunConfig::new(f.project, mode))
        .await
}

fn dest_image(f: &Fixture, report: &MigrationReport, name: &str) -> ImageId {
    let container = report
        .container(f.dataset)
        .expect("dataset report")
        .destination_container;
    f.store
        .images_in(container)
        .into_iter()
        .find(|i| i.name == name)
        .expect("copied image")
        .id
}

fn exterior(f: &Fixture, image: ImageId, object: usize) -> Value {
    f.store.annotation(image).expect("annotation")["objects"][object]["points"]["exterior"].clone()
}

fn tag_names(value: &Value) -> Vec<String> {
    value["tags"]
        .as_array()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_correct_mode_fails_batch_with_uncorrectable_polyline() {
    let f = fixture();
    let report = migrate(&f, config(), RunMode::Correct).await.unwrap();

    assert_eq!(report.images, 3);
    assert_eq!(report.batches_uploaded, 2);
    assert_eq!(report.batches_failed, 1);
    assert!(!report.is_complete());
    assert_eq!(report.outcomes.corrected, 1);
    assert_eq!(report.outcomes.unresolved, 1);

    let first = dest_image(&f, &report, "1.jpg");
    assert_eq!(exterior(&f, first, 0), json!([[0.0, 0.0], [4.0, 0.0], [4.0, 0.0]]));
    assert_eq!(exterior(&f, first, 1), json!([[1.0, 1.0], [3.0, 2.0]]));

    let dataset = report.container(f.dataset).unwrap();
    assert_eq!(dataset.unresolved.len(), 1);
    assert_eq!(dataset.failures.len(), 1);
    assert_eq!(dataset.failures[0].class, ErrorClass::UncorrectableObject.to_string());
    assert_eq!(dataset.unresolved[0].kind.as_deref(), Some("line"));
}

#[tokio::test]
async fn test_correct_mode_pads_polylines_when_enabled() {
    let f = fixture();
    let config = config().with_rules(RuleConfig::default().with_polyline_correction(true));
    let report = migrate(&f, config, RunMode::Correct).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.outcomes.corrected, 2);
    assert_eq!(report.outcomes.valid, 2);

    let second = dest_image(&f, &report, "2.jpg");
    assert_eq!(exterior(&f, second, 0), json!([[5.0, 5.0], [5.0, 5.0]]));
}

#[tokio::test]
async fn test_tag_mode_tags_each_invalid_object_once() {
    let f = fixture();
    let report = migrate(&f, config(), RunMode::tag("Invalid Annotation"))
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.outcomes.tagged, 2);
    assert_eq!(report.outcomes.valid, 2);

    let first = f.store.annotation(dest_image(&f, &report, "1.jpg")).unwrap();
    assert_eq!(tag_names(&first["objects"][0]), vec!["Invalid Annotation"]);
    assert!(tag_names(&first["objects"][1]).is_empty());
    assert_eq!(tag_names(&first), vec!["Invalid Annotation"]);

    let second = f.store.annotation(dest_image(&f, &report, "2.jpg")).unwrap();
    assert_eq!(tag_names(&second["objects"][0]), vec!["Invalid Annotation"]);

    let third = f.store.annotation(dest_image(&f, &report, "3.jpg")).unwrap();
    assert!(tag_names(&third).is_empty());

    // Source project is never modified.
    let source = f.store.images_in(f.dataset);
    let original = f.store.annotation(source[0].id).unwrap();
    assert!(tag_names(&original["objects"][0]).is_empty());

    assert_eq!(f.progress.last_for(f.dataset), Some(3));
}

#[tokio::test]
async fn test_remove_mode_drops_invalid_objects() {
    let f = fixture();
    let report = migrate(&f, config(), RunMode::Remove).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.outcomes.removed, 2);

    let first = f.store.annotation(dest_image(&f, &report, "1.jpg")).unwrap();
    assert_eq!(first["objects"].as_array().unwrap().len(), 1);
    let second = f.store.annotation(dest_image(&f, &report, "2.jpg")).unwrap();
    assert!(second["objects"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_nested_datasets_keep_parent_linkage() {
    let f = fixture();
    let north = f.store.add_container(f.project, "north", Some(f.dataset));
    f.store.add_container(f.project, "harbour", Some(north));

    let report = migrate(&f, config(), RunMode::Remove).await.unwrap();
    assert_eq!(report.containers.len(), 3);

    let city = report.container(f.dataset).unwrap().destination_container;
    let dest_north = report.container(north).unwrap().destination_container;
    let mirrored = f.store.containers_of(report.destination_project.id);
    let north_info = mirrored.iter().find(|c| c.id == dest_north).unwrap();
    let harbour_info = mirrored.iter().find(|c| c.name == "harbour").unwrap();
    assert_eq!(north_info.parent_id, Some(city));
    assert_eq!(harbour_info.parent_id, Some(dest_north));
}

#[tokio::test]
async fn test_transient_download_error_is_retried() {
    let f = fixture();
    f.store.inject_fault(
        StoreOperation::DownloadAnnotations,
        StoreError::Timeout("annotation download".into()),
    );
    let report = migrate(&f, config(), RunMode::Remove).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(f.store.calls(StoreOperation::DownloadAnnotations), 4);
}

#[tokio::test]
async fn test_fatal_store_error_aborts_migration() {
    let f = fixture();
    f.store.inject_fault(
        StoreOperation::CopyImages,
        StoreError::PaymentRequired("plan expired".into()),
    );
    let err = migrate(&f, config(), RunMode::Remove).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::FatalStore);
    assert_eq!(f.store.calls(StoreOperation::UploadAnnotations), 0);
}

#[tokio::test]
async fn test_each_image_downloaded_exactly_once() {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(2)));
    let project = store.add_project("fields");
    let dataset = store.add_container(project, "plots", None);
    for i in 0..24 {
        store.add_image(
            dataset,
            &format!("{:02}.jpg", i),
            json!({"tags": [], "objects": [polygon(json!([[0.0, 0.0], [1.0, 1.0]]))]}),
        );
    }
    let config = MigrationConfig::default()
        .with_page_size(9)
        .with_batch_size(3)
        .with_download_workers(3)
        .with_upload_workers(2);
    let report = TreeOrchestrator::new(
        store.clone(),
        store.clone(),
        config,
        Arc::new(RecordingProgress::new()),
    )
    .unwrap()
    .run(&RunConfig::new(project, RunMode::Correct))
    .await
    .unwrap();

    assert_eq!(report.batches_uploaded, 8);
    let destination = report.container(dataset).unwrap().destination_container;
    for image in store.images_in(destination) {
        assert_eq!(store.downloads_of(image.id), 1);
    }
    assert_eq!(store.calls(StoreOperation::DownloadAnnotations), 8);
    assert!(store.max_concurrent_downloads() <= 3);
}
