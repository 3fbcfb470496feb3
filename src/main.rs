mod config;
mod error;
mod logging;
mod models;
mod orchestrator;
mod pipeline;
mod protocol;
mod scrapers;
mod store;

use crate::config::{ConfigLoader, DriverKind, ScraperConfig, KNOWN_KEYS};
use crate::models::{Account, RunStatus};
use crate::pipeline::{spawn_ticker, ProgressBoard, RunController, OWNER_ROLE, TICK};
use crate::protocol::{emit, RunOutcome};
use crate::scrapers::{ChromeDriver, HttpDriver, PageDriver, SessionFingerprint};
use crate::store::{AccountStore, RunStore, SettingsStore, SqliteStore};
use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "lbc-scout", version, about = "Leboncoin colocation scraper")]
struct Cli {
    /// SQLite database shared with the admin side
    #[arg(long, env = "LBC_DB", default_value = "scout.db", global = true)]
    db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape in this process. Exits 0 on success, 1 on failure, 2 when paused on a captcha
    Scrape,
    /// Start a tracked scrape in a child process
    Run {
        /// Abort a run still marked as running
        #[arg(long)]
        force: bool,
        /// Let the scraper read captcha confirmations from this terminal
        #[arg(long)]
        interactive: bool,
    },
    /// Stop the running scrape
    Abort,
    /// Show recent runs
    Status {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Read or change scraper settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Register the account that owns scraped listings
    Owner { email: String },
}

#[derive(Subcommand)]
enum SettingsAction {
    List,
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            RunOutcome::Failed.into()
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let db = cli.db;
    let open = || -> anyhow::Result<Arc<SqliteStore>> {
        let store = SqliteStore::open(&db)
            .with_context(|| format!("Failed to open database {}", db.display()))?;
        Ok(Arc::new(store))
    };

    match cli.command {
        Commands::Scrape => Ok(scrape(&db).await.into()),
        Commands::Run { force, interactive } => run(open()?, &db, force, interactive).await,
        Commands::Abort => {
            match orchestrator::abort_running(&*open()?, Utc::now())? {
                Some(run) => info!(id = %run.id, "Run aborted"),
                None => info!("No run in progress"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { limit } => {
            let runs = open()?.recent_runs(limit)?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Settings { action } => settings(&*open()?, action),
        Commands::Owner { email } => {
            let store = open()?;
            if let Some(existing) = store.find_account_by_role(OWNER_ROLE)? {
                info!(email = %existing.email, "An owner account already exists");
                return Ok(ExitCode::SUCCESS);
            }
            let account = Account::new(&email, OWNER_ROLE);
            store.insert_account(&account)?;
            info!(id = %account.id, %email, "Owner account created");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn settings(store: &SqliteStore, action: SettingsAction) -> anyhow::Result<ExitCode> {
    match action {
        SettingsAction::List => {
            let mut stored: Vec<_> = store.load_settings()?.into_iter().collect();
            stored.sort();
            for (key, value) in stored {
                println!("{key}={value}");
            }
        }
        SettingsAction::Get { key } => match store.load_settings()?.get(&key) {
            Some(value) => println!("{value}"),
            None => {
                warn!(%key, "Setting not stored, the built-in default applies");
                return Ok(ExitCode::FAILURE);
            }
        },
        SettingsAction::Set { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                bail!("Unknown setting {key}; expected one of {}", KNOWN_KEYS.join(", "));
            }
            store.put_setting(&key, &value)?;
            info!(%key, "Setting saved");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn open_driver(
    config: &ScraperConfig,
    fingerprint: &SessionFingerprint,
) -> anyhow::Result<Arc<dyn PageDriver>> {
    match config.driver_kind() {
        DriverKind::Chrome => {
            let (config, fingerprint) = (config.clone(), fingerprint.clone());
            let driver = tokio::task::spawn_blocking(move || ChromeDriver::launch(&config, &fingerprint))
                .await
                .context("Browser launch task panicked")??;
            Ok(Arc::new(driver))
        }
        DriverKind::Http => Ok(Arc::new(HttpDriver::new(config, fingerprint)?)),
    }
}

/// One scrape in this process. The final protocol lines are printed on every path.
async fn scrape(db: &Path) -> RunOutcome {
    let (outcome, board) = scrape_session(db).await;
    for line in board.final_lines() {
        emit(&line);
    }
    outcome
}

async fn scrape_session(db: &Path) -> (RunOutcome, ProgressBoard) {
    let board = ProgressBoard::new();
    let outcome = match SqliteStore::open(db) {
        Ok(store) => scrape_with(Arc::new(store), &board).await,
        Err(e) => {
            error!(error = %e, db = %db.display(), "Failed to open database");
            RunOutcome::Failed
        }
    };
    (outcome, board)
}

async fn scrape_with(store: Arc<SqliteStore>, board: &ProgressBoard) -> RunOutcome {
    let config = match ConfigLoader::new().load(&*store) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid scraper configuration");
            return RunOutcome::Failed;
        }
    };
    board.set_cooldown(config.cooldown_hours);

    let fingerprint = SessionFingerprint::new(config.datadome.clone());
    info!(
        user_agent = fingerprint.user_agent(),
        token = fingerprint.token().is_some(),
        max_listings = config.max_listings,
        "Starting scrape"
    );

    let driver = match open_driver(&config, &fingerprint).await {
        Ok(driver) => driver,
        Err(e) => {
            error!("Could not start page driver: {e:#}");
            return RunOutcome::Failed;
        }
    };

    let ticker = spawn_ticker(board.clone(), TICK);
    let controller = RunController::new(config, store, Arc::clone(&driver), fingerprint, board.clone());

    let outcome = match tokio::spawn(controller.run()).await {
        Ok(report) => {
            info!(
                outcome = ?report.outcome,
                collected = report.collected,
                created = report.tally.created,
                updated = report.tally.updated,
                skipped_recent = report.tally.skipped_recent,
                skipped_no_id = report.tally.skipped_no_id,
                failed = report.tally.failed,
                "Scrape finished"
            );
            report.outcome
        }
        Err(e) => {
            error!(error = %e, "Scraper pipeline crashed");
            RunOutcome::Failed
        }
    };

    ticker.abort();
    if let Err(e) = driver.close().await {
        warn!(error = %e, "Failed to close page driver");
    }
    outcome
}

/// Tracked run: a child `scrape` process supervised by this one
async fn run(store: Arc<SqliteStore>, db: &Path, force: bool, interactive: bool) -> anyhow::Result<ExitCode> {
    let record = orchestrator::begin_run(&*store, force, Utc::now())?;

    let exe = std::env::current_exe().context("Cannot locate the scraper executable")?;
    let mut command = tokio::process::Command::new(exe);
    command.arg("--db").arg(db).arg("scrape");

    let settled = orchestrator::run_tracked(&*store, record, command, interactive, TICK).await?;
    info!(
        id = %settled.id,
        status = settled.status.as_str(),
        collected = settled.collected,
        created = settled.created,
        updated = settled.updated,
        "Run finished"
    );

    let outcome = match settled.status {
        RunStatus::Success => RunOutcome::Success,
        RunStatus::Paused => RunOutcome::PausedForCaptcha,
        _ => RunOutcome::Failed,
    };
    Ok(outcome.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unopenable_database_still_reports_final_counters() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("missing").join("scout.db");

        let (outcome, board) = scrape_session(&db).await;

        assert_eq!(outcome, RunOutcome::Failed);
        let lines = board.final_lines();
        assert!(lines.iter().any(|l| l.starts_with("[[LBC_METRICS]]")));
        assert_eq!(
            lines.last().map(String::as_str),
            Some("Scraping completed: 0 listings collected")
        );
    }
}
