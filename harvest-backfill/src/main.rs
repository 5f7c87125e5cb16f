//! harvest-backfill - historical session backfill CLI
//!
//! Discovers sessions from the portal listing into the local store, then
//! imports them one at a time under the configured rate limit. Ctrl+C or
//! SIGTERM pauses a run at the next safe point; `resume` continues it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use harvest_backfill::config::AppConfig;
use harvest_backfill::models::{SelectionFilter, SessionDescriptor};
use harvest_backfill::services::{
    BackfillOrchestrator, DiscoveryFilters, HttpImporter, HttpPortalClient, LogNotifier,
    Notifier, OperatorCommands, RunOutcome, SessionDiscoverer, WebhookNotifier,
};
use harvest_backfill::store::{DiscoveryStore, SqliteDiscoveryStore};
use harvest_common::config::{database_path, default_config_path, RootFolderResolver};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", ",
    env!("BUILD_PROFILE"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

/// Command-line arguments for harvest-backfill
#[derive(Parser, Debug)]
#[command(name = "harvest-backfill")]
#[command(about = "Discover and backfill historical sessions from the portal")]
#[command(version = VERSION)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, env = "HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// Root folder holding the database
    #[arg(short, long, env = "HARVEST_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the portal listing and record sessions as pending
    Discover {
        #[arg(long)]
        max_pages: Option<u32>,

        /// Stop after this many valid rows
        #[arg(long)]
        max_results: Option<u32>,
    },

    /// Start a new backfill run over pending sessions
    Run {
        /// Print what would be imported and exit
        #[arg(long)]
        dry_run: bool,
    },

    /// Continue the latest running or paused run
    Resume,

    /// Reset needs_review sessions and run over exactly those
    RetryFailed {
        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        dry_run: bool,
    },

    /// Return a needs_review session to pending with a fresh retry budget
    Retry { report_id: String },

    /// Never import this session
    Skip { report_id: String },

    /// Return an imported or skipped session to pending
    Reset { report_id: String },

    /// Set a session's date by hand (YYYY-MM-DD)
    SetDate { report_id: String, date: NaiveDate },

    /// Counts by status, sessions needing review, active run
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Recent runs, newest first
    Runs {
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Mark the latest running or paused run failed so a new run may start
    Abandon,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    #[arg(long)]
    date_start: Option<NaiveDate>,

    #[arg(long)]
    date_end: Option<NaiveDate>,

    /// Match sessions carrying any of these tags (repeatable)
    #[arg(long = "tag")]
    tags: Vec<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> SelectionFilter {
        SelectionFilter {
            date_start: self.date_start,
            date_end: self.date_end,
            tags: self.tags.iter().cloned().collect(),
            report_ids: None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.common.logging.level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("harvest-backfill {}", VERSION);
    if config_path.exists() {
        info!("Config: {}", config_path.display());
    } else {
        warn!("Config {} not found, using defaults", config_path.display());
    }

    let root_folder = RootFolderResolver::new("backfill")
        .with_cli_arg(cli.root_folder.clone())
        .with_toml(&config.common)
        .resolve();
    let db_path = database_path(&root_folder, &config.common.database);
    info!("Database: {}", db_path.display());

    let store: Arc<dyn DiscoveryStore> = Arc::new(
        SqliteDiscoveryStore::open(&db_path, &config.common.database)
            .await
            .context("Failed to open database")?,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command {
        Command::Discover {
            max_pages,
            max_results,
        } => discover(&config, store, max_pages, max_results, &cancel).await,
        Command::Run { dry_run } => {
            let orchestrator = build_orchestrator(&config, store, dry_run)?;
            report_outcome(orchestrator.run(&cancel).await?);
            Ok(())
        }
        Command::Resume => {
            let orchestrator = build_orchestrator(&config, store, false)?;
            report_outcome(orchestrator.resume(&cancel).await?);
            Ok(())
        }
        Command::RetryFailed { filter, dry_run } => {
            let orchestrator = build_orchestrator(&config, store, dry_run)?;
            report_outcome(
                orchestrator
                    .retry_failed(&filter.to_filter(), &cancel)
                    .await?,
            );
            Ok(())
        }
        Command::Retry { report_id } => {
            print_descriptor(&OperatorCommands::new(store).retry(&report_id).await?);
            Ok(())
        }
        Command::Skip { report_id } => {
            print_descriptor(&OperatorCommands::new(store).skip(&report_id).await?);
            Ok(())
        }
        Command::Reset { report_id } => {
            print_descriptor(&OperatorCommands::new(store).reset(&report_id).await?);
            Ok(())
        }
        Command::SetDate { report_id, date } => {
            print_descriptor(
                &OperatorCommands::new(store)
                    .set_session_date(&report_id, date)
                    .await?,
            );
            Ok(())
        }
        Command::Status { json } => status(store, json).await,
        Command::Runs { limit } => {
            for run in OperatorCommands::new(store).runs(limit).await? {
                println!(
                    "{}  {:<9}  started {}  total {}  processed {}  imported {}  failed {}{}",
                    run.run_id,
                    run.status.as_str(),
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.sessions_total,
                    run.sessions_processed,
                    run.sessions_imported,
                    run.sessions_failed,
                    run.error
                        .as_deref()
                        .map(|e| format!("  error: {}", e))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Abandon => {
            let run = OperatorCommands::new(store).abandon().await?;
            println!("Run {} marked failed", run.run_id);
            Ok(())
        }
    }
}

async fn discover(
    config: &AppConfig,
    store: Arc<dyn DiscoveryStore>,
    max_pages: Option<u32>,
    max_results: Option<u32>,
    cancel: &CancellationToken,
) -> Result<()> {
    let portal = HttpPortalClient::new(
        config.portal.require_base_url("portal")?,
        config.portal.timeout(),
    )?;
    let limiter = Arc::new(config.backfill.rate_limiter()?);
    let discoverer = SessionDiscoverer::new(Arc::new(portal), store, limiter).with_page_retry(
        config.discovery.page_attempts,
        config.discovery.page_retry_delay(),
    );

    let filters = DiscoveryFilters {
        max_pages: max_pages.or(config.discovery.max_pages),
        max_results: max_results.or(config.discovery.max_results),
    };
    let report = discoverer.discover(&filters, cancel).await?;

    println!(
        "Discovery {:?}: {} new, {} known ({} updated), {} invalid, {} date-flagged, {} pages",
        report.stop_reason,
        report.new,
        report.known,
        report.updated,
        report.invalid,
        report.date_flagged,
        report.pages_fetched
    );
    if let Some(error) = &report.last_error {
        println!("Last page error: {}", error);
    }
    Ok(())
}

fn build_orchestrator(
    config: &AppConfig,
    store: Arc<dyn DiscoveryStore>,
    dry_run: bool,
) -> Result<BackfillOrchestrator> {
    let mut run_config = config.backfill.to_run_config()?;
    run_config.dry_run |= dry_run;

    let importer = HttpImporter::new(
        config.importer.require_base_url("importer")?,
        config.importer.timeout(),
    )?;
    let limiter = Arc::new(config.backfill.rate_limiter()?);

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.importer.timeout())?),
        None => Arc::new(LogNotifier),
    };

    Ok(
        BackfillOrchestrator::new(store, Arc::new(importer), limiter, run_config)?
            .with_notifier(notifier),
    )
}

fn report_outcome(outcome: RunOutcome) {
    match outcome {
        RunOutcome::DryRun(plan) => {
            println!(
                "Dry run: {} of {} matching sessions would be processed",
                plan.descriptors.len(),
                plan.matched
            );
            for descriptor in &plan.descriptors {
                println!(
                    "  {}  {}",
                    descriptor.report_id,
                    descriptor
                        .session_date
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "undated".to_string())
                );
            }
        }
        RunOutcome::NothingSelected => println!("Nothing to do"),
        RunOutcome::Completed(run) => println!(
            "Run {} completed: {} imported, {} need review",
            run.run_id, run.sessions_imported, run.sessions_failed
        ),
        RunOutcome::Paused(run) => println!(
            "Run {} paused after {} attempts; `harvest-backfill resume` continues it",
            run.run_id, run.sessions_processed
        ),
    }
}

fn print_descriptor(descriptor: &SessionDescriptor) {
    println!(
        "{}: {} (attempts {}{})",
        descriptor.report_id,
        descriptor.import_status,
        descriptor.attempt_count,
        descriptor
            .last_error
            .as_deref()
            .map(|e| format!(", last error: {}", e))
            .unwrap_or_default()
    );
}

async fn status(store: Arc<dyn DiscoveryStore>, json: bool) -> Result<()> {
    let report = OperatorCommands::new(store).status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let counts = &report.counts;
    println!(
        "pending {}  importing {}  imported {}  needs_review {}  skipped {}  (date-flagged {})",
        counts.pending,
        counts.importing,
        counts.imported,
        counts.needs_review,
        counts.skipped,
        counts.date_flagged
    );
    if let Some(run) = &report.active_run {
        println!(
            "Active run {} ({}): {}/{} processed, cursor {}",
            run.run_id,
            run.status,
            run.sessions_processed,
            run.sessions_total,
            run.last_processed_report_id.as_deref().unwrap_or("-")
        );
    }
    for item in &report.needs_review {
        println!(
            "  needs review: {} after {} attempts: {}",
            item.report_id,
            item.attempt_count,
            item.last_error.as_deref().unwrap_or("-")
        );
    }
    for report_id in &report.date_flagged {
        println!("  date flagged: {}", report_id);
    }
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, pausing at the next safe point"),
        _ = terminate => info!("Received terminate signal, pausing at the next safe point"),
    }
    token.cancel();
}
