//! Backfill run database operations

use harvest_common::time::{parse_db_timestamp, parse_optional_db_timestamp, to_db_timestamp};
use harvest_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{BackfillRun, RunStatus};

const RUN_COLUMNS: &str = "run_id, status, started_at, updated_at, completed_at, sessions_total, \
     sessions_processed, sessions_imported, sessions_failed, last_processed_report_id, \
     config_snapshot, error";

fn row_to_run(row: &SqliteRow) -> Result<BackfillRun> {
    let status: String = row.try_get("status")?;
    let started_at: String = row.try_get("started_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(BackfillRun {
        run_id: row.try_get("run_id")?,
        status: status.parse::<RunStatus>().map_err(Error::Internal)?,
        started_at: parse_db_timestamp("started_at", &started_at)?,
        updated_at: parse_db_timestamp("updated_at", &updated_at)?,
        completed_at: parse_optional_db_timestamp("completed_at", completed_at.as_deref())?,
        sessions_total: row.try_get("sessions_total")?,
        sessions_processed: row.try_get("sessions_processed")?,
        sessions_imported: row.try_get("sessions_imported")?,
        sessions_failed: row.try_get("sessions_failed")?,
        last_processed_report_id: row.try_get("last_processed_report_id")?,
        config_snapshot: row.try_get("config_snapshot")?,
        error: row.try_get("error")?,
    })
}

/// The single-running partial index surfaces as a unique violation
fn map_running_conflict(err: sqlx::Error, run_id: &str) -> Error {
    let is_unique = matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
    if is_unique {
        Error::Conflict(format!(
            "cannot mark run {} running: another run is already running",
            run_id
        ))
    } else {
        Error::Database(err)
    }
}

/// Insert a new run; `Conflict` if another run is already `running`
pub async fn insert_run(pool: &SqlitePool, run: &BackfillRun) -> Result<()> {
    let sql = format!(
        "INSERT INTO backfill_runs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        RUN_COLUMNS
    );
    sqlx::query(&sql)
        .bind(&run.run_id)
        .bind(run.status.as_str())
        .bind(to_db_timestamp(&run.started_at))
        .bind(to_db_timestamp(&run.updated_at))
        .bind(run.completed_at.as_ref().map(to_db_timestamp))
        .bind(run.sessions_total)
        .bind(run.sessions_processed)
        .bind(run.sessions_imported)
        .bind(run.sessions_failed)
        .bind(&run.last_processed_report_id)
        .bind(&run.config_snapshot)
        .bind(&run.error)
        .execute(pool)
        .await
        .map_err(|e| map_running_conflict(e, &run.run_id))?;
    Ok(())
}

/// Persist run progress (checkpoint or final state)
pub async fn update_run(pool: &SqlitePool, run: &BackfillRun) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE backfill_runs SET
            status = ?,
            updated_at = ?,
            completed_at = ?,
            sessions_total = ?,
            sessions_processed = ?,
            sessions_imported = ?,
            sessions_failed = ?,
            last_processed_report_id = ?,
            error = ?
        WHERE run_id = ?
        "#,
    )
    .bind(run.status.as_str())
    .bind(to_db_timestamp(&run.updated_at))
    .bind(run.completed_at.as_ref().map(to_db_timestamp))
    .bind(run.sessions_total)
    .bind(run.sessions_processed)
    .bind(run.sessions_imported)
    .bind(run.sessions_failed)
    .bind(&run.last_processed_report_id)
    .bind(&run.error)
    .bind(&run.run_id)
    .execute(pool)
    .await
    .map_err(|e| map_running_conflict(e, &run.run_id))?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("backfill run {}", run.run_id)));
    }
    Ok(())
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<BackfillRun>> {
    let sql = format!("SELECT {} FROM backfill_runs WHERE run_id = ?", RUN_COLUMNS);
    let row = sqlx::query(&sql)
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_run).transpose()
}

/// Most recently started run that is `running` or `paused`
pub async fn latest_resumable_run(pool: &SqlitePool) -> Result<Option<BackfillRun>> {
    let sql = format!(
        "SELECT {} FROM backfill_runs WHERE status IN (?, ?) \
         ORDER BY started_at DESC, rowid DESC LIMIT 1",
        RUN_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(RunStatus::Running.as_str())
        .bind(RunStatus::Paused.as_str())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_run).transpose()
}

/// Most recent runs first
pub async fn list_runs(pool: &SqlitePool, limit: u32) -> Result<Vec<BackfillRun>> {
    let sql = format!(
        "SELECT {} FROM backfill_runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        RUN_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;

    rows.iter().map(row_to_run).collect()
}
