//! Durable descriptor and run storage
//!
//! [`DiscoveryStore`] is the only way the discoverer, the orchestrator and the
//! operator commands touch persisted state. Two backends ship:
//! [`SqliteDiscoveryStore`] for the binary and [`MemoryDiscoveryStore`] for
//! tests and embedding. Both enforce the same transition rules and the same
//! single-running-run constraint.

mod memory;
mod sqlite;

pub use memory::MemoryDiscoveryStore;
pub use sqlite::SqliteDiscoveryStore;

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_common::Result;
use serde::Serialize;

use crate::models::{
    BackfillRun, DateSource, DescriptorUpsert, ImportStatus, SelectionFilter, SessionDescriptor,
    Transition,
};

/// Result of an upsert keyed on `report_id`
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Created(SessionDescriptor),
    Existing {
        descriptor: SessionDescriptor,
        /// Some discovery-owned column changed
        changed: bool,
    },
}

impl UpsertOutcome {
    pub fn descriptor(&self) -> &SessionDescriptor {
        match self {
            UpsertOutcome::Created(descriptor) => descriptor,
            UpsertOutcome::Existing { descriptor, .. } => descriptor,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

/// Descriptor counts by import status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub importing: i64,
    pub imported: i64,
    pub needs_review: i64,
    pub skipped: i64,
    /// Rows carrying the date disagreement flag (any status)
    pub date_flagged: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ImportStatus, count: i64) {
        match status {
            ImportStatus::Pending => self.pending += count,
            ImportStatus::Importing => self.importing += count,
            ImportStatus::Imported => self.imported += count,
            ImportStatus::NeedsReview => self.needs_review += count,
            ImportStatus::Skipped => self.skipped += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.importing + self.imported + self.needs_review + self.skipped
    }
}

/// Terminal outcomes among descriptors whose `last_run_id` is a given run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOutcomeCounts {
    pub imported: i64,
    pub needs_review: i64,
    pub skipped: i64,
}

impl RunOutcomeCounts {
    pub fn add(&mut self, status: ImportStatus, count: i64) {
        match status {
            ImportStatus::Imported => self.imported += count,
            ImportStatus::NeedsReview => self.needs_review += count,
            ImportStatus::Skipped => self.skipped += count,
            ImportStatus::Pending | ImportStatus::Importing => {}
        }
    }

    pub fn terminal(&self) -> i64 {
        self.imported + self.needs_review + self.skipped
    }
}

/// Persistence contract for discovery, orchestration and operator commands
///
/// Status-changing methods are conditional on the current status: a write
/// whose precondition no longer holds fails with `Error::Conflict` (or
/// `Error::NotFound`) and changes nothing.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    /// Atomic read-merge-write keyed on `report_id`
    async fn upsert_descriptor(&self, incoming: &DescriptorUpsert) -> Result<UpsertOutcome>;

    async fn get_descriptor(&self, report_id: &str) -> Result<Option<SessionDescriptor>>;

    /// All descriptors, optionally restricted to one status, ordered by report id
    async fn list_descriptors(&self, status: Option<ImportStatus>)
        -> Result<Vec<SessionDescriptor>>;

    /// `pending` descriptors accepted by `filter`, in no particular order
    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<SessionDescriptor>>;

    /// `pending -> importing`, stamping `last_run_id`; `None` if no longer pending
    async fn begin_import(&self, report_id: &str, run_id: &str)
        -> Result<Option<SessionDescriptor>>;

    /// `importing -> pending` when the importer was never called
    async fn release_import(&self, report_id: &str) -> Result<SessionDescriptor>;

    /// `importing -> imported`, counting the attempt
    async fn complete_import(&self, report_id: &str, record_count: i64)
        -> Result<SessionDescriptor>;

    /// Count a failed attempt; `requeue` picks `pending` over `needs_review`
    async fn record_failure(
        &self,
        report_id: &str,
        error: &str,
        requeue: bool,
    ) -> Result<SessionDescriptor>;

    /// Return rows stuck in `importing` (crashed process) to `pending`
    async fn recover_in_flight(&self) -> Result<Vec<String>>;

    /// Operator retry / skip / reset
    async fn apply_operator_transition(
        &self,
        report_id: &str,
        transition: Transition,
    ) -> Result<SessionDescriptor>;

    /// Bulk `needs_review -> pending` (attempt counters cleared); returns the ids
    async fn reset_needs_review(&self, filter: &SelectionFilter) -> Result<Vec<String>>;

    /// Apply a date using the discovery merge rule
    async fn set_session_date(
        &self,
        report_id: &str,
        date: NaiveDate,
        source: DateSource,
    ) -> Result<SessionDescriptor>;

    async fn status_counts(&self) -> Result<StatusCounts>;

    async fn count_run_outcomes(&self, run_id: &str) -> Result<RunOutcomeCounts>;

    /// Insert a run; `Conflict` if it is `running` while another run is
    async fn create_run(&self, run: &BackfillRun) -> Result<()>;

    async fn save_run(&self, run: &BackfillRun) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<BackfillRun>>;

    /// Most recently started `running` or `paused` run
    async fn latest_resumable_run(&self) -> Result<Option<BackfillRun>>;

    async fn list_runs(&self, limit: u32) -> Result<Vec<BackfillRun>>;
}
