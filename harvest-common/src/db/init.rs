//! Database initialization
//!
//! Opens (creating if needed) the SQLite file and creates the two tables
//! that make up the entire durable footprint:
//! - `session_descriptors`: what exists on the portal and how far its import got
//! - `backfill_runs`: one row per orchestration run, including its checkpoint

use crate::config::DatabaseConfig;
use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path, config: &DatabaseConfig) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL lets readers proceed while the orchestrator holds the single writer slot;
    // busy_timeout is set per connection so every pooled connection waits on locks
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_tables(&pool).await?;

    info!(
        busy_timeout_ms = config.busy_timeout_ms,
        "Database tables initialized (session_descriptors, backfill_runs)"
    );

    Ok(pool)
}

/// Create all tables and indexes (idempotent - safe to call multiple times)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_session_descriptors_table(pool).await?;
    create_backfill_runs_table(pool).await?;
    Ok(())
}

/// Create the session_descriptors table
///
/// One row per externally discoverable session, keyed by the portal's report id.
pub async fn create_session_descriptors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_descriptors (
            report_id TEXT PRIMARY KEY,
            access_key TEXT NOT NULL,
            display_name TEXT,
            session_date TEXT,
            date_source TEXT NOT NULL DEFAULT 'none'
                CHECK (date_source IN ('listing', 'report_detail', 'manual', 'none')),
            date_flagged INTEGER NOT NULL DEFAULT 0,
            tags TEXT NOT NULL DEFAULT '[]',
            import_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (import_status IN ('pending', 'importing', 'imported', 'needs_review', 'skipped')),
            record_count_actual INTEGER,
            attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
            last_error TEXT,
            last_run_id TEXT,
            discovered_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            import_completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_session_descriptors_status_date
         ON session_descriptors(import_status, session_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_session_descriptors_last_run
         ON session_descriptors(last_run_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the backfill_runs table
///
/// The partial unique index enforces "at most one running run" inside SQLite
/// itself, so two processes racing to start a run cannot both succeed.
pub async fn create_backfill_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS backfill_runs (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL
                CHECK (status IN ('running', 'paused', 'completed', 'failed')),
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            sessions_total INTEGER NOT NULL DEFAULT 0,
            sessions_processed INTEGER NOT NULL DEFAULT 0,
            sessions_imported INTEGER NOT NULL DEFAULT 0,
            sessions_failed INTEGER NOT NULL DEFAULT 0,
            last_processed_report_id TEXT,
            config_snapshot TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_backfill_runs_single_running
         ON backfill_runs(status) WHERE status = 'running'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_backfill_runs_started
         ON backfill_runs(started_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
