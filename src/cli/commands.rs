//! CLI command definitions for annotation-validator.
//!
//! The `run` command loads a project in the local layout, migrates it into
//! a validated copy and writes that copy next to the other projects in the
//! output directory.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use crate::annotation::ContainerId;
use crate::metrics;
use crate::pipeline::{
    MigrationConfig, MigrationReport, RunConfig, RunMode, TracingProgress, TreeOrchestrator,
    DEFAULT_TAG_NAME,
};
use crate::store::local::{load_project, save_project};
use crate::store::{ContainerNode, DestinationStore, MemoryStore, SourceStore};

/// Default output directory for validated projects.
const DEFAULT_OUTPUT_DIR: &str = "./validated";

/// Migrate annotated image projects while validating their geometries.
#[derive(Parser)]
#[command(name = "annotation-validator")]
#[command(about = "Copy an annotated project, tagging or correcting invalid geometries")]
#[command(version)]
#[command(
    long_about = "annotation-validator copies a project, validates every annotated object and \
    tags, corrects or removes the invalid ones in the copy.\n\nExample usage:\n  \
    annotation-validator run ./projects/roads --action correct --output ./validated"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Migrate a project into a validated copy.
    #[command(alias = "migrate")]
    Run(RunArgs),
}

/// What to do with invalid objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Tag invalid objects and their images for review.
    Tag,
    /// Replace invalid geometries with corrected ones.
    Correct,
    /// Drop invalid objects.
    Remove,
}

/// Arguments for `annotation-validator run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Project directory in the local layout (meta.json plus datasets).
    #[arg(env = "PROJECT_DIR")]
    pub project: PathBuf,

    /// Only migrate this dataset (name or id) and its nested datasets.
    #[arg(short, long, env = "DATASET_ID")]
    pub dataset: Option<String>,

    /// What to do with invalid objects.
    #[arg(short, long, value_enum, default_value = "tag", env = "VALIDATION_ACTION")]
    pub action: Action,

    /// Review tag attached in tag mode.
    #[arg(short, long, default_value = DEFAULT_TAG_NAME, env = "TAG_NAME")]
    pub tag_name: String,

    /// Directory the validated project is written to.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Concurrent batch downloads.
    #[arg(long)]
    pub download_workers: Option<usize>,

    /// Concurrent batch uploads.
    #[arg(long)]
    pub upload_workers: Option<usize>,

    /// Images per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Images per listing page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Minimum exterior vertices of a valid polygon.
    #[arg(long)]
    pub min_polygon_vertices: Option<usize>,

    /// Pad polylines with a single point instead of failing in correct mode.
    #[arg(long)]
    pub correct_polylines: bool,

    /// Upload the valid part of batches that contain uncorrectable objects.
    #[arg(long)]
    pub allow_partial_batches: bool,

    /// Output the report as JSON.
    #[arg(short, long)]
    pub json: bool,

    /// Write Prometheus metrics to this file when done.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        match self.action {
            Action::Tag => RunMode::tag(self.tag_name.clone()),
            Action::Correct => RunMode::Correct,
            Action::Remove => RunMode::Remove,
        }
    }

    /// Environment configuration with command-line overrides applied.
    fn migration_config(&self) -> anyhow::Result<MigrationConfig> {
        let mut config = MigrationConfig::from_env()?;
        if let Some(n) = self.download_workers {
            config.download_workers = n;
        }
        if let Some(n) = self.upload_workers {
            config.upload_workers = n;
        }
        if let Some(n) = self.page_size {
            config.page_size = n;
        }
        if let Some(n) = self.batch_size {
            config.batch_size = n;
            config.page_size = config.page_size.max(n);
        }
        if let Some(n) = self.min_polygon_vertices {
            config.rules.min_polygon_vertices = n;
        }
        if self.correct_polylines {
            config.rules.correct_polylines = true;
        }
        if self.allow_partial_batches {
            config.allow_partial_batches = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_migration_command(args).await,
    }
}

// ============================================================================
// Run Command Implementation
// ============================================================================

/// JSON output of the run command.
#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub status: String,
    pub output_directory: String,
    pub total_duration_ms: u64,
    pub report: MigrationReport,
}

/// Finds a dataset by id or name anywhere in the tree.
fn resolve_dataset(tree: &[ContainerNode], wanted: &str) -> Option<ContainerId> {
    let by_id = wanted.parse::<ContainerId>().ok();
    let mut stack: Vec<&ContainerNode> = tree.iter().collect();
    while let Some(node) = stack.pop() {
        if Some(node.info.id) == by_id || node.info.name == wanted {
            return Some(node.info.id);
        }
        stack.extend(node.children.iter());
    }
    None
}

async fn run_migration_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.migration_config()?;
    metrics::init_metrics()?;

    let (store, project_id) = load_project(&args.project).await?;
    let store = Arc::new(store);

    let mut run_config = RunConfig::new(project_id, args.mode());
    if let Some(wanted) = &args.dataset {
        let tree = store.list_container_tree(project_id).await?;
        let id = resolve_dataset(&tree, wanted)
            .ok_or_else(|| anyhow::anyhow!("Dataset '{}' not found in project", wanted))?;
        run_config = run_config.with_dataset(id);
    }

    let orchestrator = TreeOrchestrator::new(
        Arc::clone(&store) as Arc<dyn SourceStore>,
        Arc::clone(&store) as Arc<dyn DestinationStore>,
        config,
        Arc::new(TracingProgress::new()),
    )?;

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling migration");
            token.cancel();
        }
    });

    let start = std::time::Instant::now();
    let report = orchestrator.run(&run_config).await?;
    let written = save_project(&store, report.destination_project.id, &args.output).await?;

    if let Some(path) = &args.metrics_out {
        tokio::fs::write(path, metrics::export_metrics()).await?;
    }

    let complete = report.is_complete();
    let failed = report.batches_failed;
    print_report(&args, &store, report, &written, start.elapsed())?;

    if !complete {
        anyhow::bail!("{} batch(es) failed; see the report for details", failed);
    }
    Ok(())
}

fn print_report(
    args: &RunArgs,
    store: &MemoryStore,
    report: MigrationReport,
    written: &std::path::Path,
    elapsed: std::time::Duration,
) -> anyhow::Result<()> {
    if args.json {
        let output = RunOutput {
            status: if report.is_complete() {
                "success".to_string()
            } else {
                "partial".to_string()
            },
            output_directory: written.display().to_string(),
            total_duration_ms: elapsed.as_millis() as u64,
            report,
        };
        let json_output = serde_json::to_string_pretty(&output)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json_output);
        return Ok(());
    }

    info!(
        project = %report.destination_project.name,
        images = store.project_image_count(report.destination_project.id),
        "Validated project written to {}",
        written.display()
    );
    println!(
        "{} -> {} ({})",
        report.source_project.name, report.destination_project.name, report.mode
    );
    for container in &report.containers {
        println!(
            "  {:<24} images={:<6} invalid={:<5} batches={}/{}",
            container.name,
            container.images,
            container.outcomes.invalid(),
            container.batches_uploaded,
            container.batches
        );
        for object in &container.unresolved {
            println!("    unresolved: {}", object.reason);
        }
        for failure in &container.failures {
            println!("    failed batch {}: {}", failure.batch, failure.error);
        }
    }
    println!(
        "valid={} tagged={} corrected={} removed={} unresolved={} in {:.1}s",
        report.outcomes.valid,
        report.outcomes.tagged,
        report.outcomes.corrected,
        report.outcomes.removed,
        report.outcomes.unresolved,
        elapsed.as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContainerInfo;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["annotation-validator", "run", "./roads"])
            .expect("should parse");
        let Commands::Run(args) = cli.command;
        assert_eq!(args.project, PathBuf::from("./roads"));
        assert_eq!(args.tag_name, DEFAULT_TAG_NAME);
        assert_eq!(args.output, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert!(!args.json);
        assert!(!args.correct_polylines);
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "annotation-validator",
            "run",
            "./roads",
            "--action",
            "correct",
            "--batch-size",
            "10",
            "--correct-polylines",
            "--json",
        ])
        .expect("should parse");
        let Commands::Run(args) = cli.command;
        assert_eq!(args.action, Action::Correct);
        assert_eq!(args.mode(), RunMode::Correct);
        assert_eq!(args.batch_size, Some(10));
        assert!(args.correct_polylines);
        assert!(args.json);
    }

    #[test]
    fn test_migrate_alias() {
        let cli = Cli::try_parse_from(["annotation-validator", "migrate", "./roads", "-a", "remove"])
            .expect("should parse");
        let Commands::Run(args) = cli.command;
        assert_eq!(args.mode(), RunMode::Remove);
    }

    #[test]
    fn test_resolve_dataset_by_name_or_id() {
        let info = |id, name: &str, parent| ContainerInfo {
            id,
            project_id: 1,
            name: name.to_string(),
            parent_id: parent,
            images_count: 0,
        };
        let tree = vec![
            ContainerNode::leaf(info(2, "city", None)),
            ContainerNode {
                info: info(3, "rural", None),
                children: vec![ContainerNode::leaf(info(4, "farms", Some(3)))],
            },
        ];
        assert_eq!(resolve_dataset(&tree, "farms"), Some(4));
        assert_eq!(resolve_dataset(&tree, "2"), Some(2));
        assert_eq!(resolve_dataset(&tree, "forest"), None);
    }
}
