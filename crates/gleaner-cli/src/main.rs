use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gleaner_client::{
    HttpDetailFetcher, HttpRenderer, HttpRendererFactory, OpenAiClassifier, SelectorScraper,
};
use gleaner_core::{
    CheckpointStore, HarvestConfig, HarvestPlan, JobOrchestrator, NullStore, PageRenderer,
    PipelineRunner, ProductStore, ResourceFactory, ResourcePool, RunSummary,
};
use gleaner_db::{Database, DatabaseConfig};

/// Exit code for a run stopped by SIGINT/SIGTERM.
const EXIT_INTERRUPTED: i32 = 130;
/// Exit code for a completed run with terminal job failures.
const EXIT_FAILURES: i32 = 1;

#[derive(Parser)]
#[command(name = "gleaner", version, about = "Resumable catalog harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Harvest every store of a plan, resuming from the checkpoint
    Run(RunArgs),

    /// Show checkpoint progress per store
    Status {
        /// Checkpoint file (defaults to GLEANER_CHECKPOINT_PATH)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Forget the checkpoint entries of a store so it is harvested again
    Reset {
        /// Store to reset (repeatable)
        #[arg(short, long = "store", required = true)]
        stores: Vec<String>,

        /// Checkpoint file (defaults to GLEANER_CHECKPOINT_PATH)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the JSON harvest plan
    #[arg(short, long)]
    plan: PathBuf,

    /// Only harvest these stores (repeatable)
    #[arg(short, long = "store")]
    stores: Vec<String>,

    /// Directory for run-summary-<timestamp>.json
    #[arg(long, default_value = ".gleaner/runs")]
    summary_dir: PathBuf,

    /// Also write failed jobs to this CSV file
    #[arg(long)]
    failures_csv: Option<PathBuf>,

    /// Render listings with headless Chromium instead of plain HTTP
    #[arg(long, default_value_t = false)]
    browser: bool,

    /// Allow requests to private/reserved addresses
    #[arg(long, default_value_t = false)]
    allow_private_urls: bool,

    /// Checkpoint file (overrides GLEANER_CHECKPOINT_PATH)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Stores harvested at once (overrides GLEANER_MAX_CONCURRENT_STORES)
    #[arg(long)]
    max_concurrent_stores: Option<usize>,

    /// Pooled renderers (overrides GLEANER_POOL_SIZE)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Retries per job and per external call (overrides GLEANER_MAX_RETRIES)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Classifier API key; classification is skipped when unset
    #[arg(long, env = "GLEANER_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: Option<String>,

    /// Classifier model (e.g., "gpt-4o-mini", "gemini-2.5-flash")
    #[arg(long, env = "GLEANER_LLM_MODEL", default_value = "gpt-4o-mini")]
    llm_model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        long,
        env = "GLEANER_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    llm_base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gleaner=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let code = cmd_run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Status { checkpoint } => cmd_status(checkpoint).await?,
        Commands::Reset { stores, checkpoint } => cmd_reset(&stores, checkpoint).await?,
    }

    Ok(())
}

fn load_config(checkpoint: Option<PathBuf>) -> Result<HarvestConfig> {
    let mut config = HarvestConfig::from_env().context("Invalid GLEANER_* configuration")?;
    if let Some(path) = checkpoint {
        config.checkpoint_path = path;
    }
    Ok(config)
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("Shutdown signal received, finishing in-flight jobs");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install CTRL+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
    // 1. Configuration and plan
    let mut config = load_config(args.checkpoint.clone())?;
    if let Some(n) = args.max_concurrent_stores {
        config.max_concurrent_stores = n;
    }
    if let Some(n) = args.pool_size {
        config.pool_size = n;
    }
    if let Some(n) = args.max_retries {
        config.max_retries = n;
    }
    config.validate().context("Invalid run options")?;

    let mut plan = HarvestPlan::from_path(&args.plan)
        .with_context(|| format!("Failed to load plan {}", args.plan.display()))?;
    plan.retain_stores(&args.stores);
    if plan.stores.is_empty() {
        bail!("No stores to harvest (check --store against the plan)");
    }

    // 2. Collaborators
    let mut http = HttpRenderer::with_timeout(config.operation_timeout)
        .context("Failed to create HTTP client")?;
    if args.allow_private_urls {
        http = http.allow_private_urls();
    }

    let classifier = match &args.llm_api_key {
        Some(key) if !key.trim().is_empty() => Some(
            OpenAiClassifier::with_base_url(key, &args.llm_model, &args.llm_base_url)
                .and_then(|c| c.with_timeout(config.operation_timeout))
                .context("Failed to create classifier")?,
        ),
        _ => {
            tracing::warn!("GLEANER_LLM_API_KEY not set, products will be stored unclassified");
            None
        }
    };

    let database = match DatabaseConfig::from_env_optional()? {
        Some(db_config) => {
            let db = Database::connect(&db_config).await?;
            db.migrate().await?;
            Some(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, products will not be persisted");
            None
        }
    };

    let ctx = RunContext {
        config,
        plan,
        http,
        classifier,
        summary_dir: args.summary_dir,
        failures_csv: args.failures_csv,
    };

    // 3. Run, monomorphized per renderer and product store
    let summary = match (args.browser, &database) {
        (false, Some(db)) => {
            let factory = HttpRendererFactory::new(ctx.http.clone());
            harvest(&ctx, factory, db.product_repo()).await?
        }
        (false, None) => {
            let factory = HttpRendererFactory::new(ctx.http.clone());
            harvest(&ctx, factory, NullStore).await?
        }
        (true, db) => run_with_browser(&ctx, db.as_ref()).await?,
    };

    if let Some(db) = &database {
        db.close().await;
    }

    // 4. Report
    println!(
        "Harvested {} job(s) in {:.1}s: {} succeeded, {} skipped, {} failed, {} retried; {} inserted, {} updated, {} filtered out; {} classifier call(s)",
        summary.total,
        summary.duration_ms as f64 / 1000.0,
        summary.success,
        summary.skipped,
        summary.failed,
        summary.retried,
        summary.products_inserted,
        summary.products_updated,
        summary.filtered_out,
        summary.api_calls,
    );
    for failure in &summary.failures {
        println!(
            "  FAILED {}/{} after {} attempt(s): {}",
            failure.store, failure.category, failure.attempts, failure.error
        );
    }

    Ok(if summary.interrupted {
        EXIT_INTERRUPTED
    } else if summary.failed > 0 {
        EXIT_FAILURES
    } else {
        0
    })
}

#[cfg(feature = "browser")]
async fn run_with_browser(ctx: &RunContext, db: Option<&Database>) -> Result<RunSummary> {
    let factory = gleaner_client::BrowserFactory::with_timeout(ctx.config.operation_timeout);
    match db {
        Some(db) => harvest(ctx, factory, db.product_repo()).await,
        None => harvest(ctx, factory, NullStore).await,
    }
}

#[cfg(not(feature = "browser"))]
async fn run_with_browser(_ctx: &RunContext, _db: Option<&Database>) -> Result<RunSummary> {
    bail!("--browser requires gleaner to be built with `--features browser`")
}

struct RunContext {
    config: HarvestConfig,
    plan: HarvestPlan,
    http: HttpRenderer,
    classifier: Option<OpenAiClassifier>,
    summary_dir: PathBuf,
    failures_csv: Option<PathBuf>,
}

async fn harvest<F, P>(ctx: &RunContext, factory: F, store: P) -> Result<RunSummary>
where
    F: ResourceFactory,
    F::Resource: PageRenderer,
    P: ProductStore,
{
    let config = &ctx.config;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let checkpoint = Arc::new(CheckpointStore::load(&config.checkpoint_path).await);
    let pool = ResourcePool::new("renderers", factory, config.pool_size);

    // Background tasks outlive the run's cancellation so the wind-down is
    // still flushed and reaped.
    let background = CancellationToken::new();
    let reaper = pool.spawn_reaper(
        config
            .pool_idle_timeout
            .clamp(Duration::from_secs(1), Duration::from_secs(60)),
        config.pool_idle_timeout,
        background.clone(),
    );
    let flusher = checkpoint.spawn_flusher(config.checkpoint_flush_interval, background.clone());

    let pipeline = PipelineRunner::new(
        SelectorScraper::from_plan(&ctx.plan),
        HttpDetailFetcher::from_plan(ctx.http.clone(), &ctx.plan),
        ctx.classifier.clone(),
        store,
        config.pipeline(),
    )
    .with_cancellation(cancel.clone());

    let orchestrator = JobOrchestrator::new(
        pool.clone(),
        pipeline,
        Arc::clone(&checkpoint),
        config.orchestrator(),
    )
    .with_cancellation(cancel);

    let summary = orchestrator.run(&ctx.plan).await;

    background.cancel();
    let _ = flusher.await;
    let _ = reaper.await;
    checkpoint
        .flush()
        .await
        .context("Failed to write final checkpoint")?;
    let destroyed = pool.shutdown().await;
    tracing::debug!(destroyed, "Resource pool shut down");

    let path = summary
        .write_to_dir(&ctx.summary_dir)
        .context("Failed to write run summary")?;
    tracing::info!(path = %path.display(), "Run summary written");

    if let Some(csv_path) = &ctx.failures_csv {
        write_failures_csv(&summary, csv_path)?;
        tracing::info!(path = %csv_path.display(), failures = summary.failures.len(), "Failures written");
    }

    Ok(summary)
}

fn write_failures_csv(summary: &RunSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for failure in &summary.failures {
        writer.serialize(failure)?;
    }
    writer.flush()?;
    Ok(())
}

async fn cmd_status(checkpoint: Option<PathBuf>) -> Result<()> {
    let config = load_config(checkpoint)?;
    let store = CheckpointStore::load(&config.checkpoint_path).await;
    let data = store.snapshot();

    if data.stores.is_empty() {
        println!("No progress recorded in {}", config.checkpoint_path.display());
        return Ok(());
    }

    println!("Checkpoint {}:\n", config.checkpoint_path.display());
    for (name, record) in &data.stores {
        println!(
            "  {name}: {} completed, {} failed",
            record.completed.len(),
            record.failed.len()
        );
        for category in &record.failed {
            println!("    failed: {category}");
        }
    }

    println!(
        "\nTotal: {} completed, {} failed, {} classifier call(s)",
        data.completed_count(),
        data.failed_count(),
        data.api_calls_used
    );
    if let Some(saved) = data.last_saved {
        println!("Last saved: {}", saved.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

async fn cmd_reset(stores: &[String], checkpoint: Option<PathBuf>) -> Result<()> {
    let config = load_config(checkpoint)?;
    let store = CheckpointStore::load(&config.checkpoint_path).await;

    for name in stores {
        if store.reset_scope(name) {
            println!("Reset {name}");
        } else {
            println!("No progress recorded for {name}");
        }
    }

    store
        .flush_if_dirty()
        .await
        .context("Failed to write checkpoint")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use gleaner_core::{FailedJob, StoreReport};

    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "gleaner", "run", "--plan", "plan.json", "--store", "acme", "--store", "zeta",
            "--max-retries", "5",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.stores, vec!["acme", "zeta"]);
        assert_eq!(args.max_retries, Some(5));
        assert_eq!(args.summary_dir, PathBuf::from(".gleaner/runs"));
        assert!(!args.browser);
    }

    #[test]
    fn test_reset_requires_store() {
        assert!(Cli::try_parse_from(["gleaner", "reset"]).is_err());
        assert!(Cli::try_parse_from(["gleaner", "reset", "-s", "acme"]).is_ok());
    }

    #[test]
    fn test_failures_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut summary = RunSummary::from_stores(Utc::now(), vec![StoreReport::new("acme")], false);
        summary.failures.push(FailedJob {
            store: "acme".into(),
            category: "tops".into(),
            url: "https://acme.test/tops".into(),
            attempts: 4,
            error: "Network error: reset".into(),
        });

        let path = dir.path().join("out/failures.csv");
        write_failures_csv(&summary, &path).unwrap();

        let csv = std::fs::read_to_string(&path).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("store,category,url,attempts,error"));
        assert_eq!(
            lines.next(),
            Some("acme,tops,https://acme.test/tops,4,Network error: reset")
        );
    }
}
