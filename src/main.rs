mod bookmarks;
mod compression;
mod config;
mod error;
mod llm;
mod metrics;
mod models;
mod operations;
mod organizer;
mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use bookmarks::InMemoryBookmarkStore;
use config::AppConfig;
use error::PipelineError;
use llm::{OpenAiGateway, RetryPolicy};
use models::{Flow, ModelRegistry};
use organizer::{ApplyReport, Organizer, PlanDocument};
use pipeline::{explain, CancellationFlag, ChunkDelay, DecisionSummary, TracingProgress};

#[derive(Parser, Debug)]
#[command(
    name = "marksmith",
    about = "Reorganize a bookmark tree into folders with the help of a language model"
)]
struct Cli {
    /// Model id from the registry; defaults to MARKSMITH_MODEL or gpt-4o.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Force a processing flow (single-shot or chunked) instead of letting the size decide.
    #[arg(long, global = true)]
    flow: Option<Flow>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure the tree and show which flow would run, with cost and time estimates.
    Analyze {
        /// JSON file holding a getTree()-shaped bookmark array.
        tree: PathBuf,
    },
    /// Ask the model for a reorganization plan and write it to a file.
    Plan {
        tree: PathBuf,
        #[arg(long, default_value = "plan.json")]
        out: PathBuf,
    },
    /// Apply a previously written plan to the tree.
    Apply {
        tree: PathBuf,
        plan: PathBuf,
        /// Check every operation against the tree without changing it.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        /// Where to write the reorganized tree; defaults to overwriting `tree`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Plan and apply in one go.
    Organize {
        tree: PathBuf,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify the configured API key against the provider.
    CheckKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("Failed to read configuration")?;
    let result = run(cli, config).await;

    if let Err(err) = &result {
        if let Some(hint) = err
            .downcast_ref::<PipelineError>()
            .and_then(PipelineError::hint)
        {
            error!("{hint}");
        }
    }
    result
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .try_init();
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    let registry = Arc::new(config.load_registry()?);
    let model = cli.model.clone().unwrap_or_else(|| config.model.clone());

    match cli.command {
        Commands::Analyze { tree } => {
            let store = load_store(&tree)?;
            // Analysis never calls the model, so no key is needed.
            let gateway = OpenAiGateway::new(config.gateway.clone(), &registry)?;
            let organizer = Organizer::new(registry, Arc::new(gateway), store).with_flow(cli.flow);
            let decision = organizer.analyze(&model).await?;
            println!("{}", explain(&decision));
            println!(
                "{}",
                serde_json::to_string_pretty(&DecisionSummary::from(&decision))?
            );
        }
        Commands::Plan { tree, out } => {
            let store = load_store(&tree)?;
            let organizer = build_organizer(&config, registry, store, cli.flow)?;
            let planned = organizer.plan(&model, &TracingProgress).await?;

            let document = PlanDocument::from_run(planned);
            document.save(&out)?;
            info!(
                path = %out.display(),
                operations = document.operations.len(),
                "Plan written"
            );
        }
        Commands::Apply {
            tree,
            plan,
            dry_run,
            out,
        } => {
            let store = load_store(&tree)?;
            let document = PlanDocument::load(&plan)?;
            let snapshot = store.snapshot()?;
            if !document.matches(&snapshot)? {
                warn!(
                    plan = %plan.display(),
                    "Bookmark tree changed since the plan was made; applying anyway"
                );
            }

            let organizer = build_organizer(&config, registry, store.clone(), cli.flow)?;
            let report = organizer
                .apply(document.operations, dry_run, &TracingProgress)
                .await?;
            print_apply_report(&report)?;
            if !dry_run {
                save_store(&store, out.as_deref().unwrap_or(&tree))?;
            }
        }
        Commands::Organize { tree, dry_run, out } => {
            let store = load_store(&tree)?;
            let organizer = build_organizer(&config, registry, store.clone(), cli.flow)?;
            let report = organizer.run(&model, dry_run, &TracingProgress).await?;
            for warning in &report.warnings {
                warn!(%warning, "Plan warning");
            }
            print_apply_report(&report.apply)?;
            if !dry_run {
                save_store(&store, out.as_deref().unwrap_or(&tree))?;
            }
        }
        Commands::CheckKey => {
            config.gateway.require_api_key()?;
            let gateway = OpenAiGateway::new(config.gateway.clone(), &registry)?;
            if !gateway.validate_api_key().await? {
                bail!("API key rejected by {}", config.gateway.base_url);
            }
            println!("API key accepted by {}", config.gateway.base_url);
        }
    }

    Ok(())
}

fn load_store(path: &Path) -> anyhow::Result<Arc<InMemoryBookmarkStore>> {
    let store = InMemoryBookmarkStore::load(path)
        .with_context(|| format!("Failed to load bookmark tree from {}", path.display()))?;
    Ok(Arc::new(store))
}

fn save_store(store: &InMemoryBookmarkStore, path: &Path) -> anyhow::Result<()> {
    store
        .save(path)
        .with_context(|| format!("Failed to write bookmark tree to {}", path.display()))?;
    info!(path = %path.display(), "Bookmark tree written");
    Ok(())
}

fn build_organizer(
    config: &AppConfig,
    registry: Arc<ModelRegistry>,
    store: Arc<InMemoryBookmarkStore>,
    flow: Option<Flow>,
) -> anyhow::Result<Organizer> {
    config.gateway.require_api_key()?;
    let gateway = OpenAiGateway::new(config.gateway.clone(), &registry)?;

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current step");
            on_signal.cancel();
        }
    });

    Ok(Organizer::new(registry, Arc::new(gateway), store)
        .with_retry(RetryPolicy::default().with_max_attempts(config.retry_attempts))
        .with_chunk_delay(ChunkDelay::with_base(Duration::from_millis(
            config.chunk_delay_ms,
        )))
        .with_cancellation(cancel)
        .with_flow(flow))
}

fn print_apply_report(report: &ApplyReport) -> anyhow::Result<()> {
    for finding in &report.dry_run.errors {
        warn!(operation = %finding.operation, message = %finding.message, "Skipped operation");
    }
    match &report.execution {
        Some(execution) => {
            info!(
                successful = execution.successful,
                failed = execution.failed,
                "Reorganization applied"
            );
            println!("{}", serde_json::to_string_pretty(execution)?);
        }
        None => {
            info!(
                valid = report.dry_run.valid,
                invalid = report.dry_run.invalid,
                "Dry run finished; nothing changed"
            );
            println!("{}", serde_json::to_string_pretty(&report.dry_run)?);
        }
    }
    Ok(())
}
