//! Tree orchestrator for whole-project migrations.
//!
//! This module provides the `TreeOrchestrator` that:
//! - Creates the destination project from the source project meta
//! - Registers the review tag in tag mode
//! - Walks the source container tree depth-first
//! - Mirrors every container with explicit parent linkage
//! - Runs the batch pipeline per container

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::annotation::{ContainerId, ProjectId};
use crate::error::MigrationError;
use crate::rules::RuleRegistry;
use crate::store::{find_subtree, with_retry, ContainerNode, DestinationStore, ProjectInfo, SourceStore};
use crate::validation::{OutcomeCounts, ValidationStage};

use super::batch::{BatchPipeline, ContainerReport};
use super::config::{MigrationConfig, RunConfig};
use super::progress::ProgressReporter;
use super::run::{PipelineRun, RunMode};

/// Name of the destination project for a source project.
///
/// Names with spaces get ` (validated)`; others get `_validated`.
pub fn new_project_name(name: &str) -> String {
    if name.contains(' ') {
        format!("{} (validated)", name)
    } else {
        format!("{}_validated", name)
    }
}

/// Summary of a whole migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source_project: ProjectInfo,
    pub destination_project: ProjectInfo,
    pub mode: RunMode,
    pub containers: Vec<ContainerReport>,
    pub images: usize,
    pub batches_uploaded: usize,
    pub batches_failed: usize,
    pub outcomes: OutcomeCounts,
}

impl MigrationReport {
    fn new(source_project: ProjectInfo, destination_project: ProjectInfo, mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            source_project,
            destination_project,
            mode,
            containers: Vec::new(),
            images: 0,
            batches_uploaded: 0,
            batches_failed: 0,
            outcomes: OutcomeCounts::default(),
        }
    }

    fn push(&mut self, container: ContainerReport) {
        self.images += container.images;
        self.batches_uploaded += container.batches_uploaded;
        self.batches_failed += container.batches_failed;
        self.outcomes.merge(&container.outcomes);
        self.containers.push(container);
    }

    /// True when every batch of every container was uploaded.
    pub fn is_complete(&self) -> bool {
        self.batches_failed == 0
    }

    /// Report of the container mirrored from `source`.
    pub fn container(&self, source: ContainerId) -> Option<&ContainerReport> {
        self.containers
            .iter()
            .find(|c| c.source_container == source)
    }
}

/// Walks a source project and migrates it container by container.
pub struct TreeOrchestrator {
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    pipeline: BatchPipeline,
    cancel: CancellationToken,
}

impl TreeOrchestrator {
    /// Creates an orchestrator with the standard rule registry.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if the configuration is invalid.
    pub fn new(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        config: MigrationConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        let registry = Arc::new(RuleRegistry::standard(&config.rules));
        let stage =
            ValidationStage::new(registry).with_partial_batches(config.allow_partial_batches);
        Ok(Self::with_stage(source, destination, config, stage, progress))
    }

    /// Creates an orchestrator with a custom validation stage.
    pub fn with_stage(
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        config: MigrationConfig,
        stage: ValidationStage,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        let pipeline = BatchPipeline::new(
            Arc::clone(&source),
            Arc::clone(&destination),
            stage,
            config,
            progress,
        );
        Self {
            source,
            destination,
            pipeline,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels the run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Migrates the project (or dataset subtree) named by `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`MigrationError`] on fatal store errors, a missing dataset
    /// or any failure that stops a container from being processed.
    pub async fn run(&self, config: &RunConfig) -> Result<MigrationReport, MigrationError> {
        let retry = &self.pipeline.config().retry;

        let project = with_retry(retry, "project_info", || {
            self.source.project_info(config.project_id)
        })
        .await
        .map_err(MigrationError::from_store)?;
        let meta = with_retry(retry, "project_meta", || {
            self.source.project_meta(config.project_id)
        })
        .await
        .map_err(MigrationError::from_store)?;
        let tree = with_retry(retry, "list_container_tree", || {
            self.source.list_container_tree(config.project_id)
        })
        .await
        .map_err(MigrationError::from_store)?;

        let roots: Vec<&ContainerNode> = match config.dataset_id {
            Some(id) => vec![find_subtree(&tree, id).ok_or(MigrationError::DatasetNotFound(id))?],
            None => tree.iter().collect(),
        };

        let name = new_project_name(&project.name);
        let destination = with_retry(retry, "create_project", || {
            self.destination.create_project(&name, &meta)
        })
        .await
        .map_err(MigrationError::from_store)?;

        if let Some(tag) = config.mode.tag_descriptor() {
            with_retry(retry, "ensure_tag_meta", || {
                self.destination.ensure_tag_meta(destination.id, tag)
            })
            .await
            .map_err(MigrationError::from_store)?;
        }

        info!(
            source = %project.name,
            destination = %destination.name,
            mode = %config.mode,
            containers = roots.iter().map(|r| r.count()).sum::<usize>(),
            "Starting migration"
        );

        let mut report = MigrationReport::new(project, destination.clone(), config.mode.clone());
        for root in roots {
            self.walk(root, destination.id, None, &config.mode, &mut report)
                .await?;
        }

        report.finished_at = Some(Utc::now());
        info!(
            run_id = %report.run_id,
            destination = %report.destination_project.name,
            containers = report.containers.len(),
            images = report.images,
            failed_batches = report.batches_failed,
            "Migration finished"
        );
        Ok(report)
    }

    /// Mirrors `node` under `parent`, migrates it, then its children.
    fn walk<'a>(
        &'a self,
        node: &'a ContainerNode,
        project: ProjectId,
        parent: Option<ContainerId>,
        mode: &'a RunMode,
        report: &'a mut MigrationReport,
    ) -> BoxFuture<'a, Result<(), MigrationError>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }

            let retry = &self.pipeline.config().retry;
            let created = with_retry(retry, "create_container", || {
                self.destination
                    .create_container(project, &node.info.name, parent)
            })
            .await
            .map_err(MigrationError::from_store)?;

            let run = PipelineRun::new(node.info.id, created.id, node.info.name.clone(), mode.clone());
            let container_report = self.pipeline.run(&run, &self.cancel).await?;
            report.push(container_report);

            for child in &node.children {
                self.walk(child, project, Some(created.id), mode, report)
                    .await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::progress::RecordingProgress;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn orchestrator(store: &Arc<MemoryStore>) -> TreeOrchestrator {
        TreeOrchestrator::new(
            store.clone(),
            store.clone(),
            MigrationConfig::default(),
            Arc::new(RecordingProgress::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_new_project_name() {
        assert_eq!(new_project_name("roads"), "roads_validated");
        assert_eq!(new_project_name("city roads"), "city roads (validated)");
    }

    #[tokio::test]
    async fn test_mirrors_parent_linkage() {
        let store = Arc::new(MemoryStore::new());
        let project = store.add_project("roads");
        let city = store.add_container(project, "city", None);
        let north = store.add_container(project, "north", Some(city));
        store.add_container(project, "rural", None);
        store.add_image(north, "1.jpg", json!({"tags": [], "objects": []}));

        let report = orchestrator(&store)
            .run(&RunConfig::new(project, RunMode::Correct))
            .await
            .unwrap();

        let dest = report.destination_project.id;
        assert_eq!(report.destination_project.name, "roads_validated");
        let mirrored = store.containers_of(dest);
        assert_eq!(mirrored.len(), 3);

        let dest_city = report.container(city).unwrap().destination_container;
        let dest_north = mirrored.iter().find(|c| c.name == "north").unwrap();
        assert_eq!(dest_north.parent_id, Some(dest_city));
        assert_eq!(report.images, 1);
        assert!(report.finished_at.unwrap() >= report.started_at);
    }

    #[tokio::test]
    async fn test_dataset_subtree_in_second_branch() {
        let store = Arc::new(MemoryStore::new());
        let project = store.add_project("roads");
        store.add_container(project, "city", None);
        let rural = store.add_container(project, "rural", None);
        let farms = store.add_container(project, "farms", Some(rural));

        let report = orchestrator(&store)
            .run(&RunConfig::new(project, RunMode::Correct).with_dataset(farms))
            .await
            .unwrap();

        assert_eq!(report.containers.len(), 1);
        assert_eq!(report.containers[0].name, "farms");
    }

    #[tokio::test]
    async fn test_missing_dataset() {
        let store = Arc::new(MemoryStore::new());
        let project = store.add_project("roads");
        store.add_container(project, "city", None);

        let err = orchestrator(&store)
            .run(&RunConfig::new(project, RunMode::Correct).with_dataset(999))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::DatasetNotFound(999)));
    }

    #[tokio::test]
    async fn test_tag_mode_registers_tag_meta() {
        let store = Arc::new(MemoryStore::new());
        let project = store.add_project("roads");
        store.add_container(project, "city", None);

        let report = orchestrator(&store)
            .run(&RunConfig::new(project, RunMode::tag("")))
            .await
            .unwrap();

        let meta = store
            .project_meta(report.destination_project.id)
            .await
            .unwrap();
        assert_eq!(meta["tags"][0]["name"], "need validation");
    }
}
