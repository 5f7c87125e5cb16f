//! Operator commands over individual descriptors and runs
//!
//! These only touch the store; none of them calls the importer or takes a
//! rate-limit token.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{BackfillError, BackfillResult};
use crate::models::{
    BackfillRun, DateSource, ImportStatus, RunStatus, SessionDescriptor, Transition,
};
use crate::store::{DiscoveryStore, StatusCounts};

/// A descriptor waiting for an operator decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewItem {
    pub report_id: String,
    pub attempt_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub needs_review: Vec<ReviewItem>,
    /// Rows whose date sources disagree
    pub date_flagged: Vec<String>,
    /// Latest `running` or `paused` run
    pub active_run: Option<BackfillRun>,
}

pub struct OperatorCommands {
    store: Arc<dyn DiscoveryStore>,
}

impl OperatorCommands {
    pub fn new(store: Arc<dyn DiscoveryStore>) -> Self {
        Self { store }
    }

    /// `needs_review -> pending` with a fresh attempt budget
    pub async fn retry(&self, report_id: &str) -> BackfillResult<SessionDescriptor> {
        self.transition(report_id, Transition::Retry).await
    }

    /// Exclude a descriptor from every future run
    pub async fn skip(&self, report_id: &str) -> BackfillResult<SessionDescriptor> {
        self.transition(report_id, Transition::Skip).await
    }

    /// Put an imported or skipped descriptor back to `pending`
    pub async fn reset(&self, report_id: &str) -> BackfillResult<SessionDescriptor> {
        self.transition(report_id, Transition::Reset).await
    }

    /// Correct a session date; an operator date outranks every other source
    pub async fn set_session_date(
        &self,
        report_id: &str,
        date: NaiveDate,
    ) -> BackfillResult<SessionDescriptor> {
        let descriptor = self
            .store
            .set_session_date(report_id, date, DateSource::Manual)
            .await?;
        tracing::info!(
            report_id = %report_id,
            session_date = %date,
            date_flagged = descriptor.date_flagged,
            "Session date set"
        );
        Ok(descriptor)
    }

    pub async fn status(&self) -> BackfillResult<StatusReport> {
        let counts = self.store.status_counts().await?;

        let needs_review = self
            .store
            .list_descriptors(Some(ImportStatus::NeedsReview))
            .await?
            .into_iter()
            .map(|d| ReviewItem {
                report_id: d.report_id,
                attempt_count: d.attempt_count,
                last_error: d.last_error,
            })
            .collect();

        let date_flagged = self
            .store
            .list_descriptors(None)
            .await?
            .into_iter()
            .filter(|d| d.date_flagged)
            .map(|d| d.report_id)
            .collect();

        let active_run = self.store.latest_resumable_run().await?;

        Ok(StatusReport {
            counts,
            needs_review,
            date_flagged,
            active_run,
        })
    }

    /// Most recent runs first
    pub async fn runs(&self, limit: u32) -> BackfillResult<Vec<BackfillRun>> {
        Ok(self.store.list_runs(limit).await?)
    }

    /// Give up on the latest `running`/`paused` run so a new one may start
    ///
    /// Rows a crashed process left `importing` go back to `pending`.
    pub async fn abandon(&self) -> BackfillResult<BackfillRun> {
        let mut run = self
            .store
            .latest_resumable_run()
            .await?
            .ok_or(BackfillError::NoResumableRun)?;

        let previous = run.status;
        run.finish(
            RunStatus::Failed,
            Some(format!("abandoned by operator while {}", previous)),
        );
        self.store.save_run(&run).await?;

        let recovered = self.store.recover_in_flight().await?;
        tracing::warn!(
            run_id = %run.run_id,
            previous_status = %previous,
            recovered = recovered.len(),
            "Run abandoned"
        );
        Ok(run)
    }

    async fn transition(
        &self,
        report_id: &str,
        transition: Transition,
    ) -> BackfillResult<SessionDescriptor> {
        let descriptor = self
            .store
            .apply_operator_transition(report_id, transition)
            .await?;
        tracing::info!(
            report_id = %report_id,
            transition = transition.name(),
            status = %descriptor.import_status,
            "Operator transition applied"
        );
        Ok(descriptor)
    }
}
