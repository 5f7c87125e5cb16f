//! Session descriptor database operations
//!
//! Status changes are conditional updates: the `WHERE import_status IN (...)`
//! clause comes from [`Transition::allowed_from_sql`], and an update touching
//! no row is reported as `NotFound` or `Conflict` after a follow-up read.

use chrono::{DateTime, NaiveDate, Utc};
use harvest_common::time::{
    parse_db_date, parse_db_timestamp, parse_optional_db_timestamp, to_db_date, to_db_timestamp,
};
use harvest_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeSet;

use crate::models::{
    merge_descriptor, DateSource, DescriptorUpsert, ImportStatus, SelectionFilter,
    SessionDescriptor, Transition,
};
use crate::store::{RunOutcomeCounts, StatusCounts, UpsertOutcome};

const DESCRIPTOR_COLUMNS: &str = "report_id, access_key, display_name, session_date, date_source, \
     date_flagged, tags, import_status, record_count_actual, attempt_count, last_error, \
     last_run_id, discovered_at, updated_at, import_completed_at";

fn row_to_descriptor(row: &SqliteRow) -> Result<SessionDescriptor> {
    let session_date: Option<String> = row.try_get("session_date")?;
    let session_date = session_date
        .map(|d| parse_db_date("session_date", &d))
        .transpose()?;

    let date_source: String = row.try_get("date_source")?;
    let date_source: DateSource = date_source.parse().map_err(Error::Internal)?;

    let import_status: String = row.try_get("import_status")?;
    let import_status: ImportStatus = import_status.parse().map_err(Error::Internal)?;

    let tags: String = row.try_get("tags")?;
    let tags: BTreeSet<String> = serde_json::from_str(&tags)
        .map_err(|e| Error::Internal(format!("Failed to deserialize tags: {}", e)))?;

    let discovered_at: String = row.try_get("discovered_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let import_completed_at: Option<String> = row.try_get("import_completed_at")?;

    Ok(SessionDescriptor {
        report_id: row.try_get("report_id")?,
        access_key: row.try_get("access_key")?,
        display_name: row.try_get("display_name")?,
        session_date,
        date_source,
        date_flagged: row.try_get::<i64, _>("date_flagged")? != 0,
        tags,
        import_status,
        record_count_actual: row.try_get("record_count_actual")?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        last_run_id: row.try_get("last_run_id")?,
        discovered_at: parse_db_timestamp("discovered_at", &discovered_at)?,
        updated_at: parse_db_timestamp("updated_at", &updated_at)?,
        import_completed_at: parse_optional_db_timestamp(
            "import_completed_at",
            import_completed_at.as_deref(),
        )?,
    })
}

fn tags_json(tags: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(tags)
        .map_err(|e| Error::Internal(format!("Failed to serialize tags: {}", e)))
}

async fn fetch_descriptor<'e, E>(executor: E, report_id: &str) -> Result<Option<SessionDescriptor>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {} FROM session_descriptors WHERE report_id = ?",
        DESCRIPTOR_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(report_id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(row_to_descriptor).transpose()
}

async fn insert_descriptor(conn: &mut SqliteConnection, d: &SessionDescriptor) -> Result<()> {
    let sql = format!(
        "INSERT INTO session_descriptors ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        DESCRIPTOR_COLUMNS
    );
    sqlx::query(&sql)
        .bind(&d.report_id)
        .bind(&d.access_key)
        .bind(&d.display_name)
        .bind(d.session_date.as_ref().map(to_db_date))
        .bind(d.date_source.as_str())
        .bind(d.date_flagged as i64)
        .bind(tags_json(&d.tags)?)
        .bind(d.import_status.as_str())
        .bind(d.record_count_actual)
        .bind(d.attempt_count)
        .bind(&d.last_error)
        .bind(&d.last_run_id)
        .bind(to_db_timestamp(&d.discovered_at))
        .bind(to_db_timestamp(&d.updated_at))
        .bind(d.import_completed_at.as_ref().map(to_db_timestamp))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Write back the discovery-owned columns; lifecycle columns are untouched
async fn update_discovery_fields(conn: &mut SqliteConnection, d: &SessionDescriptor) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE session_descriptors SET
            access_key = ?,
            display_name = ?,
            session_date = ?,
            date_source = ?,
            date_flagged = ?,
            tags = ?,
            updated_at = ?
        WHERE report_id = ?
        "#,
    )
    .bind(&d.access_key)
    .bind(&d.display_name)
    .bind(d.session_date.as_ref().map(to_db_date))
    .bind(d.date_source.as_str())
    .bind(d.date_flagged as i64)
    .bind(tags_json(&d.tags)?)
    .bind(to_db_timestamp(&d.updated_at))
    .bind(&d.report_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert or merge a discovered descriptor in one transaction
pub async fn upsert_descriptor(
    pool: &SqlitePool,
    incoming: &DescriptorUpsert,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome> {
    let mut tx = pool.begin().await?;

    let outcome = match fetch_descriptor(&mut *tx, &incoming.report_id).await? {
        None => {
            let descriptor = SessionDescriptor::from_upsert(incoming, now);
            insert_descriptor(&mut tx, &descriptor).await?;
            UpsertOutcome::Created(descriptor)
        }
        Some(existing) => {
            let merged = merge_descriptor(&existing, incoming, now);
            if merged.changed {
                update_discovery_fields(&mut tx, &merged.descriptor).await?;
            }
            UpsertOutcome::Existing {
                descriptor: merged.descriptor,
                changed: merged.changed,
            }
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

/// Apply a date from a specific source using the discovery merge rule
pub async fn set_session_date(
    pool: &SqlitePool,
    report_id: &str,
    date: NaiveDate,
    source: DateSource,
    now: DateTime<Utc>,
) -> Result<SessionDescriptor> {
    let mut tx = pool.begin().await?;

    let existing = fetch_descriptor(&mut *tx, report_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session descriptor {}", report_id)))?;

    let incoming = DescriptorUpsert {
        report_id: report_id.to_string(),
        session_date: Some(date),
        date_source: source,
        ..DescriptorUpsert::default()
    };
    let merged = merge_descriptor(&existing, &incoming, now);
    if merged.changed {
        update_discovery_fields(&mut tx, &merged.descriptor).await?;
    }

    tx.commit().await?;
    Ok(merged.descriptor)
}

pub async fn get_descriptor(pool: &SqlitePool, report_id: &str) -> Result<Option<SessionDescriptor>> {
    fetch_descriptor(pool, report_id).await
}

/// All descriptors (optionally one status), by report id
pub async fn list_descriptors(
    pool: &SqlitePool,
    status: Option<ImportStatus>,
) -> Result<Vec<SessionDescriptor>> {
    let rows = match status {
        Some(status) => {
            let sql = format!(
                "SELECT {} FROM session_descriptors WHERE import_status = ? ORDER BY report_id",
                DESCRIPTOR_COLUMNS
            );
            sqlx::query(&sql)
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        None => {
            let sql = format!(
                "SELECT {} FROM session_descriptors ORDER BY report_id",
                DESCRIPTOR_COLUMNS
            );
            sqlx::query(&sql).fetch_all(pool).await?
        }
    };

    rows.iter().map(row_to_descriptor).collect()
}

/// Pending descriptors accepted by `filter` (unordered)
pub async fn select_candidates(
    pool: &SqlitePool,
    filter: &SelectionFilter,
) -> Result<Vec<SessionDescriptor>> {
    let pending = list_descriptors(pool, Some(ImportStatus::Pending)).await?;
    Ok(pending.into_iter().filter(|d| filter.matches(d)).collect())
}

/// Turn a zero-row conditional update into `NotFound` / `Conflict`
async fn transition_rejected(pool: &SqlitePool, report_id: &str, transition: Transition) -> Error {
    match fetch_descriptor(pool, report_id).await {
        Ok(Some(current)) => Error::Conflict(format!(
            "cannot {} {}: status is {}",
            transition.name(),
            report_id,
            current.import_status
        )),
        Ok(None) => Error::NotFound(format!("session descriptor {}", report_id)),
        Err(e) => e,
    }
}

async fn fetch_after_transition(
    pool: &SqlitePool,
    report_id: &str,
    rows_affected: u64,
    transition: Transition,
) -> Result<SessionDescriptor> {
    if rows_affected == 0 {
        return Err(transition_rejected(pool, report_id, transition).await);
    }
    fetch_descriptor(pool, report_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("session descriptor {}", report_id)))
}

/// `pending -> importing`; `None` when the row is no longer pending
pub async fn begin_import(
    pool: &SqlitePool,
    report_id: &str,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<SessionDescriptor>> {
    let transition = Transition::Begin;
    let sql = format!(
        "UPDATE session_descriptors SET import_status = ?, last_run_id = ?, updated_at = ? \
         WHERE report_id = ? AND import_status IN {}",
        transition.allowed_from_sql()
    );
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(run_id)
        .bind(to_db_timestamp(&now))
        .bind(report_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }
    fetch_descriptor(pool, report_id).await
}

/// `importing -> pending` without counting an attempt
pub async fn release_import(
    pool: &SqlitePool,
    report_id: &str,
    now: DateTime<Utc>,
) -> Result<SessionDescriptor> {
    let transition = Transition::Release;
    let sql = format!(
        "UPDATE session_descriptors SET import_status = ?, updated_at = ? \
         WHERE report_id = ? AND import_status IN {}",
        transition.allowed_from_sql()
    );
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(to_db_timestamp(&now))
        .bind(report_id)
        .execute(pool)
        .await?;

    fetch_after_transition(pool, report_id, result.rows_affected(), transition).await
}

/// `importing -> imported`
pub async fn complete_import(
    pool: &SqlitePool,
    report_id: &str,
    record_count: i64,
    now: DateTime<Utc>,
) -> Result<SessionDescriptor> {
    let transition = Transition::Succeed;
    let sql = format!(
        "UPDATE session_descriptors SET import_status = ?, record_count_actual = ?, \
         attempt_count = attempt_count + 1, last_error = NULL, import_completed_at = ?, \
         updated_at = ? WHERE report_id = ? AND import_status IN {}",
        transition.allowed_from_sql()
    );
    let now = to_db_timestamp(&now);
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(record_count)
        .bind(&now)
        .bind(&now)
        .bind(report_id)
        .execute(pool)
        .await?;

    fetch_after_transition(pool, report_id, result.rows_affected(), transition).await
}

/// `importing -> pending` (requeue) or `importing -> needs_review`
pub async fn record_failure(
    pool: &SqlitePool,
    report_id: &str,
    error: &str,
    requeue: bool,
    now: DateTime<Utc>,
) -> Result<SessionDescriptor> {
    let transition = if requeue {
        Transition::Requeue
    } else {
        Transition::GiveUp
    };
    let sql = format!(
        "UPDATE session_descriptors SET import_status = ?, attempt_count = attempt_count + 1, \
         last_error = ?, updated_at = ? WHERE report_id = ? AND import_status IN {}",
        transition.allowed_from_sql()
    );
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(error)
        .bind(to_db_timestamp(&now))
        .bind(report_id)
        .execute(pool)
        .await?;

    fetch_after_transition(pool, report_id, result.rows_affected(), transition).await
}

/// Return every `importing` row to `pending`; yields the recovered ids
pub async fn recover_in_flight(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<String>> {
    let transition = Transition::Recover;
    let mut tx = pool.begin().await?;

    let select = format!(
        "SELECT report_id FROM session_descriptors WHERE import_status IN {} ORDER BY report_id",
        transition.allowed_from_sql()
    );
    let ids: Vec<String> = sqlx::query_scalar(&select).fetch_all(&mut *tx).await?;

    let update = format!(
        "UPDATE session_descriptors SET import_status = ?, updated_at = ? WHERE import_status IN {}",
        transition.allowed_from_sql()
    );
    sqlx::query(&update)
        .bind(transition.target().as_str())
        .bind(to_db_timestamp(&now))
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(ids)
}

/// Operator transitions: retry, skip, reset
pub async fn apply_operator_transition(
    pool: &SqlitePool,
    report_id: &str,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<SessionDescriptor> {
    let set_clause = match transition {
        Transition::Retry => "import_status = ?, attempt_count = 0, updated_at = ?",
        Transition::Skip => "import_status = ?, updated_at = ?",
        Transition::Reset => {
            "import_status = ?, attempt_count = 0, record_count_actual = NULL, \
             import_completed_at = NULL, last_error = NULL, updated_at = ?"
        }
        other => {
            return Err(Error::InvalidInput(format!(
                "{} is not an operator transition",
                other.name()
            )))
        }
    };

    let sql = format!(
        "UPDATE session_descriptors SET {} WHERE report_id = ? AND import_status IN {}",
        set_clause,
        transition.allowed_from_sql()
    );
    let result = sqlx::query(&sql)
        .bind(transition.target().as_str())
        .bind(to_db_timestamp(&now))
        .bind(report_id)
        .execute(pool)
        .await?;

    fetch_after_transition(pool, report_id, result.rows_affected(), transition).await
}

/// Bulk `needs_review -> pending` with attempt counters cleared
pub async fn reset_needs_review(
    pool: &SqlitePool,
    filter: &SelectionFilter,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let mut tx = pool.begin().await?;

    let sql = format!(
        "SELECT {} FROM session_descriptors WHERE import_status = ? ORDER BY report_id",
        DESCRIPTOR_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(ImportStatus::NeedsReview.as_str())
        .fetch_all(&mut *tx)
        .await?;

    let mut reset = Vec::new();
    for row in &rows {
        let descriptor = row_to_descriptor(row)?;
        if !filter.matches(&descriptor) {
            continue;
        }

        sqlx::query(
            "UPDATE session_descriptors SET import_status = ?, attempt_count = 0, updated_at = ? \
             WHERE report_id = ? AND import_status = ?",
        )
        .bind(ImportStatus::Pending.as_str())
        .bind(to_db_timestamp(&now))
        .bind(&descriptor.report_id)
        .bind(ImportStatus::NeedsReview.as_str())
        .execute(&mut *tx)
        .await?;

        reset.push(descriptor.report_id);
    }

    tx.commit().await?;
    Ok(reset)
}

pub async fn status_counts(pool: &SqlitePool) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT import_status, COUNT(*) FROM session_descriptors GROUP BY import_status",
    )
    .fetch_all(pool)
    .await?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        let status: ImportStatus = status.parse().map_err(Error::Internal)?;
        counts.add(status, count);
    }

    counts.date_flagged =
        sqlx::query_scalar("SELECT COUNT(*) FROM session_descriptors WHERE date_flagged != 0")
            .fetch_one(pool)
            .await?;

    Ok(counts)
}

/// Terminal outcomes of descriptors last begun by `run_id`
pub async fn count_run_outcomes(pool: &SqlitePool, run_id: &str) -> Result<RunOutcomeCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT import_status, COUNT(*) FROM session_descriptors \
         WHERE last_run_id = ? GROUP BY import_status",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    let mut counts = RunOutcomeCounts::default();
    for (status, count) in rows {
        let status: ImportStatus = status.parse().map_err(Error::Internal)?;
        counts.add(status, count);
    }
    Ok(counts)
}
