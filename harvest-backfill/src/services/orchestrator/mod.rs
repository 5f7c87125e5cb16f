//! Backfill orchestrator
//!
//! Drives selected `pending` descriptors through the importer one at a time,
//! under the shared rate limiter, with per-descriptor retry/backoff and
//! periodic run checkpoints.
//!
//! Entry points:
//! - [`BackfillOrchestrator::run`]: select, create a run, process (or plan only when `dry_run`)
//! - [`BackfillOrchestrator::resume`]: continue the latest `running`/`paused` run from its cursor
//! - [`BackfillOrchestrator::retry_failed`]: reset `needs_review` rows and run over exactly those

mod run_loop;
mod selection;

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RunConfig;
use crate::error::{BackfillError, BackfillResult};
use crate::models::{
    rotate_after_cursor, BackfillRun, ImportStatus, RunStatus, SelectionFilter, SessionDescriptor,
};
use crate::rate_limiter::RateLimiter;
use crate::services::importer::Importer;
use crate::services::notifier::{Notifier, RunEvent, RunSummary};
use crate::store::DiscoveryStore;

/// What a dry run would process, in order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DryRunPlan {
    pub descriptors: Vec<SessionDescriptor>,
    /// Rows matching the filters before `max_sessions_per_run` was applied
    pub matched: usize,
}

impl DryRunPlan {
    pub fn report_ids(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.report_id.as_str()).collect()
    }
}

/// How an orchestrator entry point ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    DryRun(DryRunPlan),
    /// Nothing matched; no run row was created
    NothingSelected,
    Completed(BackfillRun),
    /// Cancelled; resumable from the persisted cursor
    Paused(BackfillRun),
}

impl RunOutcome {
    pub fn run(&self) -> Option<&BackfillRun> {
        match self {
            RunOutcome::Completed(run) | RunOutcome::Paused(run) => Some(run),
            RunOutcome::DryRun(_) | RunOutcome::NothingSelected => None,
        }
    }
}

pub struct BackfillOrchestrator {
    store: Arc<dyn DiscoveryStore>,
    importer: Arc<dyn Importer>,
    limiter: Arc<RateLimiter>,
    notifier: Option<Arc<dyn Notifier>>,
    config: RunConfig,
}

impl BackfillOrchestrator {
    /// Rejects an invalid configuration before any work begins
    pub fn new(
        store: Arc<dyn DiscoveryStore>,
        importer: Arc<dyn Importer>,
        limiter: Arc<RateLimiter>,
        config: RunConfig,
    ) -> BackfillResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            importer,
            limiter,
            notifier: None,
            config,
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Ordered selection for the configured filters, without side effects
    pub async fn plan(&self) -> BackfillResult<DryRunPlan> {
        selection::plan(self.store.as_ref(), &self.config).await
    }

    /// Start a new run (or only plan it when `dry_run` is set)
    pub async fn run(&self, cancel: &CancellationToken) -> BackfillResult<RunOutcome> {
        if self.config.dry_run {
            return self.dry_run().await;
        }
        self.start_run(&self.config, cancel).await
    }

    /// Reset `needs_review` rows matching `filter` and run over exactly that set
    pub async fn retry_failed(
        &self,
        filter: &SelectionFilter,
        cancel: &CancellationToken,
    ) -> BackfillResult<RunOutcome> {
        if self.config.dry_run {
            let mut descriptors: Vec<SessionDescriptor> = self
                .store
                .list_descriptors(Some(ImportStatus::NeedsReview))
                .await?
                .into_iter()
                .filter(|d| filter.matches(d))
                .collect();
            crate::models::sort_for_order(self.config.order, &mut descriptors);
            for descriptor in &descriptors {
                tracing::info!(
                    report_id = %descriptor.report_id,
                    last_error = ?descriptor.last_error,
                    "Dry run: would reset and retry"
                );
            }
            let matched = descriptors.len();
            return Ok(RunOutcome::DryRun(DryRunPlan {
                descriptors,
                matched,
            }));
        }

        self.ensure_no_running_run().await?;

        let ids = self.store.reset_needs_review(filter).await?;
        if ids.is_empty() {
            tracing::info!("No needs_review descriptors matched; nothing to retry");
            return Ok(RunOutcome::NothingSelected);
        }
        tracing::info!(count = ids.len(), "Reset needs_review descriptors to pending");

        let ids: BTreeSet<String> = ids.into_iter().collect();
        let config = self.config.for_report_ids(ids);
        self.start_run(&config, cancel).await
    }

    /// Continue the most recent `running` (crashed) or `paused` run
    pub async fn resume(&self, cancel: &CancellationToken) -> BackfillResult<RunOutcome> {
        let mut run = self
            .store
            .latest_resumable_run()
            .await?
            .ok_or(BackfillError::NoResumableRun)?;

        let config: RunConfig = serde_json::from_str(&run.config_snapshot).map_err(|e| {
            BackfillError::Integrity(format!(
                "run {} has an unreadable config snapshot: {}",
                run.run_id, e
            ))
        })?;
        config.validate().map_err(|e| {
            BackfillError::Integrity(format!("run {} snapshot is invalid: {}", run.run_id, e))
        })?;

        let cursor = self.validate_cursor(&run).await?;

        if run.status == RunStatus::Paused {
            run.status = RunStatus::Running;
            run.updated_at = harvest_common::time::now();
            self.store
                .save_run(&run)
                .await
                .map_err(|e| self.map_run_conflict(e))?;
        }

        let recovered = self.store.recover_in_flight().await?;
        if !recovered.is_empty() {
            tracing::warn!(
                run_id = %run.run_id,
                recovered = ?recovered,
                "Recovered descriptors left importing by an interrupted process"
            );
        }

        let outcomes = self.store.count_run_outcomes(&run.run_id).await?;
        run.reconcile_counts(outcomes.imported, outcomes.needs_review);

        let (candidates, _) = selection::select(self.store.as_ref(), &config, false).await?;
        let mut queue = match &cursor {
            Some(cursor) => rotate_after_cursor(config.order, candidates, cursor),
            None => candidates,
        };

        if config.max_sessions_per_run.is_some() {
            let remaining = (run.sessions_total - outcomes.terminal()).max(0) as usize;
            queue = selection::fill_remaining_budget(queue, &run.run_id, remaining);
        }
        run.sessions_total = run
            .sessions_total
            .max(outcomes.terminal() + queue.len() as i64);

        self.store.save_run(&run).await?;

        tracing::info!(
            run_id = %run.run_id,
            cursor = ?run.last_processed_report_id,
            queued = queue.len(),
            imported = run.sessions_imported,
            failed = run.sessions_failed,
            "Resuming backfill run"
        );

        self.drive(run, &config, queue, cancel).await
    }

    /// The cursor must exist and show evidence of having been processed
    async fn validate_cursor(&self, run: &BackfillRun) -> BackfillResult<Option<SessionDescriptor>> {
        let Some(cursor_id) = &run.last_processed_report_id else {
            return Ok(None);
        };

        let cursor = self.store.get_descriptor(cursor_id).await?.ok_or_else(|| {
            BackfillError::Integrity(format!(
                "checkpoint cursor {} of run {} is missing from the store",
                cursor_id, run.run_id
            ))
        })?;

        let processed = match cursor.import_status {
            ImportStatus::Importing => true,
            status if status.is_terminal() => true,
            ImportStatus::Pending => {
                cursor.attempt_count > 0
                    || cursor.last_run_id.as_deref() == Some(run.run_id.as_str())
            }
            _ => false,
        };
        if !processed {
            return Err(BackfillError::Integrity(format!(
                "checkpoint cursor {} of run {} was never processed (status {}, {} attempts)",
                cursor_id, run.run_id, cursor.import_status, cursor.attempt_count
            )));
        }
        Ok(Some(cursor))
    }

    async fn dry_run(&self) -> BackfillResult<RunOutcome> {
        let plan = self.plan().await?;
        for (position, descriptor) in plan.descriptors.iter().enumerate() {
            tracing::info!(
                position = position + 1,
                report_id = %descriptor.report_id,
                session_date = ?descriptor.session_date,
                "Dry run: would import"
            );
        }
        tracing::info!(
            selected = plan.descriptors.len(),
            matched = plan.matched,
            "Dry run complete; nothing was imported"
        );
        Ok(RunOutcome::DryRun(plan))
    }

    async fn start_run(
        &self,
        config: &RunConfig,
        cancel: &CancellationToken,
    ) -> BackfillResult<RunOutcome> {
        self.ensure_no_running_run().await?;

        let (queue, matched) = selection::select(self.store.as_ref(), config, true).await?;
        if queue.is_empty() {
            tracing::info!("No pending descriptors matched the run filters");
            return Ok(RunOutcome::NothingSelected);
        }

        let run = BackfillRun::new(serde_json::to_string(config)?, queue.len() as i64);
        self.store
            .create_run(&run)
            .await
            .map_err(|e| self.map_run_conflict(e))?;

        tracing::info!(
            run_id = %run.run_id,
            selected = queue.len(),
            matched,
            order = ?config.order,
            "Backfill run started"
        );

        self.drive(run, config, queue, cancel).await
    }

    async fn ensure_no_running_run(&self) -> BackfillResult<()> {
        match self.store.latest_resumable_run().await? {
            Some(run) if run.status == RunStatus::Running => {
                Err(BackfillError::RunAlreadyActive(run.run_id))
            }
            _ => Ok(()),
        }
    }

    fn map_run_conflict(&self, err: harvest_common::Error) -> BackfillError {
        match err {
            harvest_common::Error::Conflict(message) => BackfillError::RunAlreadyActive(message),
            other => BackfillError::Store(other),
        }
    }

    async fn notify(&self, event: RunEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        if let Err(e) = notifier.notify(&event).await {
            tracing::warn!(
                run_id = %event.summary().run_id,
                event = event.name(),
                error = %e,
                "Run notification failed"
            );
        }
    }

    async fn finish_completed(&self, mut run: BackfillRun) -> BackfillResult<RunOutcome> {
        run.finish(RunStatus::Completed, None);
        self.store.save_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            total = run.sessions_total,
            processed = run.sessions_processed,
            imported = run.sessions_imported,
            failed = run.sessions_failed,
            "Backfill run completed"
        );
        self.notify(RunEvent::Completed {
            summary: RunSummary::from(&run),
        })
        .await;
        Ok(RunOutcome::Completed(run))
    }

    async fn finish_paused(&self, mut run: BackfillRun) -> BackfillResult<RunOutcome> {
        run.finish(RunStatus::Paused, None);
        self.store.save_run(&run).await?;
        tracing::info!(
            run_id = %run.run_id,
            cursor = ?run.last_processed_report_id,
            processed = run.sessions_processed,
            "Backfill run paused; resume to continue"
        );
        self.notify(RunEvent::Paused {
            summary: RunSummary::from(&run),
        })
        .await;
        Ok(RunOutcome::Paused(run))
    }

    /// Mark the run failed (best effort) and hand the error back
    async fn finish_failed(&self, mut run: BackfillRun, err: BackfillError) -> BackfillError {
        let message = err.to_string();
        run.finish(RunStatus::Failed, Some(message.clone()));
        if let Err(save_err) = self.store.save_run(&run).await {
            tracing::error!(
                run_id = %run.run_id,
                error = %save_err,
                "Could not mark backfill run failed"
            );
        }
        tracing::error!(run_id = %run.run_id, error = %message, "Backfill run failed");
        self.notify(RunEvent::Failed {
            summary: RunSummary::from(&run),
            error: message,
        })
        .await;
        err
    }
}
