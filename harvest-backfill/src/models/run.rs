//! Backfill run record
//!
//! One row per orchestration run. A run may span several processes: a crash
//! leaves it `running`, a cancellation leaves it `paused`, and `resume` picks
//! either back up from `last_processed_report_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// Runs that `resume` may continue
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Persisted run progress; counters never decrease within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillRun {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Descriptors selected for this run
    pub sessions_total: i64,
    /// Import attempts made (a retried descriptor counts once per attempt)
    pub sessions_processed: i64,
    pub sessions_imported: i64,
    /// Descriptors that ended in `needs_review`
    pub sessions_failed: i64,
    /// Checkpoint cursor
    pub last_processed_report_id: Option<String>,
    /// JSON of the run configuration
    pub config_snapshot: String,
    /// Failure reason for `failed` runs
    pub error: Option<String>,
}

impl BackfillRun {
    pub fn new(config_snapshot: String, sessions_total: i64) -> Self {
        let now = harvest_common::time::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            status: RunStatus::Running,
            started_at: now,
            updated_at: now,
            completed_at: None,
            sessions_total,
            sessions_processed: 0,
            sessions_imported: 0,
            sessions_failed: 0,
            last_processed_report_id: None,
            config_snapshot,
            error: None,
        }
    }

    /// Selected descriptors that reached a terminal state in this run
    pub fn sessions_finished(&self) -> i64 {
        self.sessions_imported + self.sessions_failed
    }

    /// Move to a final or paused state, stamping `completed_at` for final ones
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        let now = harvest_common::time::now();
        self.status = status;
        self.updated_at = now;
        self.error = error;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            self.completed_at = Some(now);
        }
    }

    /// Raise counters to at least the given values (never lowers them)
    pub fn reconcile_counts(&mut self, imported: i64, failed: i64) {
        self.sessions_imported = self.sessions_imported.max(imported);
        self.sessions_failed = self.sessions_failed.max(failed);
        self.sessions_processed = self.sessions_processed.max(self.sessions_finished());
    }
}
