//! CLI binary for generating and inspecting Fabula story artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use fabula_llm::{GenerationClient, OpenAiBackend};
use fabula_pipeline::{CacheStore, Pipeline, PipelineConfig, PipelineEvent};
use fabula_types::{SourceBook, StoryArtifact, StoryGraph, ValidationIssue};

#[derive(Parser)]
#[command(name = "fabula", version, about = "Turns books into playable interactive story graphs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a story artifact from a pre-segmented book
    Run {
        /// Path to the book JSON file (title, author, chapters)
        book: PathBuf,

        /// Output directory for the artifact and the stage cache
        #[arg(short, long, default_value = "out")]
        out: PathBuf,

        /// Approximate number of story nodes to generate
        #[arg(long, default_value_t = 40)]
        target_nodes: usize,

        /// Maximum concurrent generation calls
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Stop after the graph stage, before any content is written
        #[arg(long)]
        dry_run: bool,

        /// Model name to request from the backend
        #[arg(long)]
        model: Option<String>,
    },

    /// Check a generated artifact and report structural defects
    Validate {
        /// Path to the artifact JSON file
        artifact: PathBuf,
    },

    /// Show information about a generated artifact
    Info {
        /// Path to the artifact JSON file
        artifact: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            book,
            out,
            target_nodes,
            concurrency,
            dry_run,
            model,
        } => {
            cmd_run(&book, &out, target_nodes, concurrency, dry_run, model.as_deref()).await?;
        }
        Commands::Validate { artifact } => {
            cmd_validate(&artifact)?;
        }
        Commands::Info { artifact } => {
            cmd_info(&artifact)?;
        }
    }

    Ok(())
}

fn load_book(path: &Path) -> anyhow::Result<SourceBook> {
    let source = std::fs::read_to_string(path)?;
    let book: SourceBook = serde_json::from_str(&source)?;
    if book.chapters.is_empty() {
        anyhow::bail!("{} contains no chapters", path.display());
    }
    Ok(book)
}

fn load_artifact(path: &Path) -> anyhow::Result<StoryArtifact> {
    let source = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&source)?)
}

/// Filesystem-safe name derived from the book title.
fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("story");
    }
    slug
}

async fn cmd_run(
    book_path: &Path,
    out: &Path,
    target_nodes: usize,
    concurrency: usize,
    dry_run: bool,
    model: Option<&str>,
) -> anyhow::Result<()> {
    let book = load_book(book_path)?;

    println!("Generating: {} by {}", book.title, book.author);
    println!("Target nodes: {}", target_nodes);
    if dry_run {
        println!("(dry run -- stopping after the graph stage)");
    }

    let mut backend = OpenAiBackend::from_env()?;
    if let Some(model) = model {
        backend = backend.with_model(model);
    }
    let client = GenerationClient::new(Arc::new(backend));
    tracing::debug!(backend = client.backend_name(), concurrency, "Generation client ready");

    let cache = CacheStore::open_on_disk(out, &book, target_nodes).await?;
    let config = PipelineConfig {
        target_node_count: target_nodes,
        concurrency,
        dry_run,
    };
    let pipeline = Pipeline::new(client, cache, config);

    let mut events = pipeline.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StageStarted { stage } => {
                    println!("[{stage}] started");
                }
                PipelineEvent::StageProgress { stage, percent } if percent < 100 => {
                    println!("[{stage}] {percent}%");
                }
                PipelineEvent::StageCompleted { stage, cached, duration_ms } => {
                    if cached {
                        println!("[{stage}] served from cache");
                    } else {
                        println!("[{stage}] done in {duration_ms}ms");
                    }
                }
                PipelineEvent::StageFailed { stage, error } => {
                    println!("[{stage}] failed: {error}");
                }
                PipelineEvent::PipelineCompleted { .. } | PipelineEvent::PipelineFailed { .. } => {
                    break;
                }
                _ => {}
            }
        }
    });

    let run_result = pipeline.run(&book).await;
    printer.await.ok();
    let outcome = run_result?;

    let artifact_path = out.join(format!("{}.json", slugify(&book.title)));
    std::fs::create_dir_all(out)?;
    std::fs::write(&artifact_path, serde_json::to_string_pretty(&outcome.artifact)?)?;

    println!("\nArtifact written to {}", artifact_path.display());
    println!("Nodes: {}", outcome.artifact.nodes.len());
    print_report_summary(&outcome.report.errors, &outcome.report.warnings, &outcome.report.fixes);

    Ok(())
}

/// Report findings are data, not failures: the exit code is non-zero only
/// when the artifact cannot be loaded at all.
fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let artifact = load_artifact(path)?;

    // The validator works on a graph, so rebuild one from the artifact.
    // Repairs land on this in-memory copy only; the file is never touched.
    let mut graph = StoryGraph {
        start_node_id: artifact.initial_state.start_node_id.clone(),
        nodes: artifact.nodes,
        acts: vec![],
    };
    let report = fabula_pipeline::validate_and_repair(&mut graph);

    if report.errors.is_empty() && report.fixes.is_empty() {
        println!("Artifact is structurally sound");
    }
    for issue in &report.errors {
        println!("[ERROR] {}", describe(issue));
    }
    for issue in &report.fixes {
        println!("[FIXABLE] {}", describe(issue));
    }
    for issue in &report.warnings {
        println!("[WARN] {}", describe(issue));
    }

    println!();
    print_report_summary(&report.errors, &report.warnings, &report.fixes);

    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let artifact = load_artifact(path)?;

    println!("Title: {} by {}", artifact.meta.title, artifact.meta.author);
    println!("Generated: {} (fabula {})", artifact.meta.generated_at, artifact.meta.version);
    println!("Target nodes: {}", artifact.meta.target_node_count);
    println!("Start node: {}", artifact.initial_state.start_node_id);

    let endings = artifact.nodes.iter().filter(|n| n.is_ending()).count();
    let hubs = artifact.nodes.iter().filter(|n| n.is_hub()).count();
    let interactions: usize = artifact.nodes.iter().map(|n| n.interactions.len()).sum();
    println!("\nNodes: {} ({} endings, {} hubs)", artifact.nodes.len(), endings, hubs);
    println!("Interactions: {}", interactions);
    println!(
        "World: {} locations, {} characters, {} objects, {} items, {} flags",
        artifact.locations.len(),
        artifact.characters.len(),
        artifact.objects.len(),
        artifact.items.len(),
        artifact.variable_definitions.len()
    );

    if !artifact.initial_state.inventory.is_empty() {
        println!("Starting inventory: {}", artifact.initial_state.inventory.join(", "));
    }

    Ok(())
}

fn describe(issue: &ValidationIssue) -> String {
    match &issue.node_id {
        Some(node) => format!("{} at '{}': {}", issue.rule, node, issue.message),
        None => format!("{}: {}", issue.rule, issue.message),
    }
}

fn print_report_summary(
    errors: &[ValidationIssue],
    warnings: &[ValidationIssue],
    fixes: &[ValidationIssue],
) {
    println!(
        "Validation: {} errors, {} warnings, {} repairs",
        errors.len(),
        warnings.len(),
        fixes.len()
    );
}
