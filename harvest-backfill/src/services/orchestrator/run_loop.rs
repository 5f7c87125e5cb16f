//! Sequential processing of a run's queue
//!
//! One descriptor is in flight at a time. Each attempt takes one rate-limit
//! token; an attempt that started is never interrupted, cancellation is only
//! observed while waiting (for a token, or out a backoff sleep).

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use super::{BackfillOrchestrator, RunOutcome};
use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::config::RunConfig;
use crate::error::BackfillResult;
use crate::models::{BackfillRun, SessionDescriptor};

/// Result of one pass over a queued descriptor
enum Step {
    /// Imported, sent to review, or no longer ours to process
    Done,
    /// Failed with retries left; goes to the back of the queue
    Requeue(SessionDescriptor),
    Cancelled,
}

/// Store rejected a status write because the row moved under us
fn lost_race(err: &harvest_common::Error) -> bool {
    matches!(
        err,
        harvest_common::Error::Conflict(_) | harvest_common::Error::NotFound(_)
    )
}

impl BackfillOrchestrator {
    pub(super) async fn drive(
        &self,
        mut run: BackfillRun,
        config: &RunConfig,
        queue: Vec<SessionDescriptor>,
        cancel: &CancellationToken,
    ) -> BackfillResult<RunOutcome> {
        let policy = config.backoff_policy();
        let mut queue = VecDeque::from(queue);
        let mut checkpointed_at = run.sessions_processed;

        while let Some(candidate) = queue.pop_front() {
            if cancel.is_cancelled() {
                return self.finish_paused(run).await;
            }

            let step = match self.process_one(&mut run, &candidate, &policy, cancel).await {
                Ok(step) => step,
                Err(e) => return Err(self.finish_failed(run, e).await),
            };

            match step {
                Step::Done => {}
                Step::Requeue(descriptor) => queue.push_back(descriptor),
                Step::Cancelled => return self.finish_paused(run).await,
            }

            if run.sessions_processed - checkpointed_at >= config.checkpoint_interval as i64 {
                run.updated_at = harvest_common::time::now();
                if let Err(e) = self.store.save_run(&run).await {
                    return Err(self.finish_failed(run, e.into()).await);
                }
                checkpointed_at = run.sessions_processed;
                tracing::debug!(
                    run_id = %run.run_id,
                    cursor = ?run.last_processed_report_id,
                    processed = run.sessions_processed,
                    "Checkpoint saved"
                );
            }
        }

        self.finish_completed(run).await
    }

    async fn process_one(
        &self,
        run: &mut BackfillRun,
        candidate: &SessionDescriptor,
        policy: &BackoffPolicy,
        cancel: &CancellationToken,
    ) -> BackfillResult<Step> {
        let report_id = candidate.report_id.as_str();

        let Some(descriptor) = self.store.begin_import(report_id, &run.run_id).await? else {
            tracing::debug!(report_id = %report_id, "No longer pending; skipping");
            return Ok(Step::Done);
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.store.release_import(report_id).await?;
                tracing::info!(report_id = %report_id, "Cancelled before import; descriptor released");
                return Ok(Step::Cancelled);
            }
            _ = self.limiter.acquire() => {}
        }

        let attempt = u32::try_from(descriptor.attempt_count + 1).unwrap_or(u32::MAX);
        tracing::info!(report_id = %report_id, attempt, "Importing session");

        let result = self
            .importer
            .import_session(report_id, &descriptor.access_key)
            .await;

        run.sessions_processed += 1;
        run.last_processed_report_id = Some(report_id.to_string());

        let error = match result {
            Ok(record_count) => {
                let record_count = i64::try_from(record_count).unwrap_or(i64::MAX);
                match self.store.complete_import(report_id, record_count).await {
                    Ok(_) => {
                        run.sessions_imported += 1;
                        tracing::info!(report_id = %report_id, record_count, "Session imported");
                    }
                    Err(e) if lost_race(&e) => {
                        tracing::warn!(report_id = %report_id, error = %e, "Import finished but descriptor changed meanwhile");
                    }
                    Err(e) => return Err(e.into()),
                }
                return Ok(Step::Done);
            }
            Err(error) => error,
        };

        let decision = policy.decide(attempt);
        let requeue = matches!(decision, RetryDecision::Retry(_));
        let stored = match self
            .store
            .record_failure(report_id, &error.to_string(), requeue)
            .await
        {
            Ok(stored) => stored,
            Err(e) if lost_race(&e) => {
                tracing::warn!(report_id = %report_id, error = %e, "Import failed but descriptor changed meanwhile");
                return Ok(Step::Done);
            }
            Err(e) => return Err(e.into()),
        };

        match decision {
            RetryDecision::GiveUp => {
                run.sessions_failed += 1;
                tracing::warn!(
                    report_id = %report_id,
                    attempts = stored.attempt_count,
                    error = %error,
                    "Retries exhausted; descriptor needs review"
                );
                Ok(Step::Done)
            }
            RetryDecision::Retry(delay) => {
                tracing::warn!(
                    report_id = %report_id,
                    attempt,
                    retry_in_secs = delay.as_secs_f64(),
                    error = %error,
                    "Import failed; will retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => Ok(Step::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(Step::Requeue(stored)),
                }
            }
        }
    }
}
