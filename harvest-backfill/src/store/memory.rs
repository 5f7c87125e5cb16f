//! In-memory store
//!
//! One mutex guards all state, so each call is a single critical section.

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_common::time::now;
use harvest_common::{Error, Result};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{DiscoveryStore, RunOutcomeCounts, StatusCounts, UpsertOutcome};
use crate::models::{
    merge_descriptor, BackfillRun, DateSource, DescriptorUpsert, ImportStatus, RunStatus,
    SelectionFilter, SessionDescriptor, Transition,
};

#[derive(Debug, Default)]
struct MemoryState {
    descriptors: BTreeMap<String, SessionDescriptor>,
    /// Insertion order doubles as start order
    runs: Vec<BackfillRun>,
}

impl MemoryState {
    /// Check `transition` against the row, then mutate it in place
    fn apply<F>(&mut self, report_id: &str, transition: Transition, update: F) -> Result<SessionDescriptor>
    where
        F: FnOnce(&mut SessionDescriptor),
    {
        let descriptor = self
            .descriptors
            .get_mut(report_id)
            .ok_or_else(|| Error::NotFound(format!("session descriptor {}", report_id)))?;

        if !transition.permits(descriptor.import_status) {
            return Err(Error::Conflict(format!(
                "cannot {} {}: status is {}",
                transition.name(),
                report_id,
                descriptor.import_status
            )));
        }

        descriptor.import_status = transition.target();
        descriptor.updated_at = now();
        update(descriptor);
        Ok(descriptor.clone())
    }

    fn running_run_other_than(&self, run_id: &str) -> Option<&BackfillRun> {
        self.runs
            .iter()
            .find(|r| r.status == RunStatus::Running && r.run_id != run_id)
    }
}

/// Store kept entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryDiscoveryStore {
    state: Mutex<MemoryState>,
}

impl MemoryDiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DiscoveryStore for MemoryDiscoveryStore {
    async fn upsert_descriptor(&self, incoming: &DescriptorUpsert) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        let now = now();

        match state.descriptors.get(&incoming.report_id) {
            None => {
                let descriptor = SessionDescriptor::from_upsert(incoming, now);
                state
                    .descriptors
                    .insert(descriptor.report_id.clone(), descriptor.clone());
                Ok(UpsertOutcome::Created(descriptor))
            }
            Some(existing) => {
                let merged = merge_descriptor(existing, incoming, now);
                if merged.changed {
                    state
                        .descriptors
                        .insert(incoming.report_id.clone(), merged.descriptor.clone());
                }
                Ok(UpsertOutcome::Existing {
                    descriptor: merged.descriptor,
                    changed: merged.changed,
                })
            }
        }
    }

    async fn get_descriptor(&self, report_id: &str) -> Result<Option<SessionDescriptor>> {
        Ok(self.state.lock().await.descriptors.get(report_id).cloned())
    }

    async fn list_descriptors(
        &self,
        status: Option<ImportStatus>,
    ) -> Result<Vec<SessionDescriptor>> {
        let state = self.state.lock().await;
        Ok(state
            .descriptors
            .values()
            .filter(|d| status.map_or(true, |s| d.import_status == s))
            .cloned()
            .collect())
    }

    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<SessionDescriptor>> {
        let state = self.state.lock().await;
        Ok(state
            .descriptors
            .values()
            .filter(|d| d.import_status == ImportStatus::Pending && filter.matches(d))
            .cloned()
            .collect())
    }

    async fn begin_import(
        &self,
        report_id: &str,
        run_id: &str,
    ) -> Result<Option<SessionDescriptor>> {
        let mut state = self.state.lock().await;
        let pending = state
            .descriptors
            .get(report_id)
            .is_some_and(|d| Transition::Begin.permits(d.import_status));
        if !pending {
            return Ok(None);
        }

        state
            .apply(report_id, Transition::Begin, |d| {
                d.last_run_id = Some(run_id.to_string());
            })
            .map(Some)
    }

    async fn release_import(&self, report_id: &str) -> Result<SessionDescriptor> {
        let mut state = self.state.lock().await;
        state.apply(report_id, Transition::Release, |_| {})
    }

    async fn complete_import(
        &self,
        report_id: &str,
        record_count: i64,
    ) -> Result<SessionDescriptor> {
        let mut state = self.state.lock().await;
        state.apply(report_id, Transition::Succeed, |d| {
            d.record_count_actual = Some(record_count);
            d.attempt_count += 1;
            d.last_error = None;
            d.import_completed_at = Some(d.updated_at);
        })
    }

    async fn record_failure(
        &self,
        report_id: &str,
        error: &str,
        requeue: bool,
    ) -> Result<SessionDescriptor> {
        let transition = if requeue {
            Transition::Requeue
        } else {
            Transition::GiveUp
        };
        let mut state = self.state.lock().await;
        state.apply(report_id, transition, |d| {
            d.attempt_count += 1;
            d.last_error = Some(error.to_string());
        })
    }

    async fn recover_in_flight(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state
            .descriptors
            .values()
            .filter(|d| Transition::Recover.permits(d.import_status))
            .map(|d| d.report_id.clone())
            .collect();

        for id in &ids {
            state.apply(id, Transition::Recover, |_| {})?;
        }
        Ok(ids)
    }

    async fn apply_operator_transition(
        &self,
        report_id: &str,
        transition: Transition,
    ) -> Result<SessionDescriptor> {
        let mut state = self.state.lock().await;
        match transition {
            Transition::Retry => state.apply(report_id, transition, |d| d.attempt_count = 0),
            Transition::Skip => state.apply(report_id, transition, |_| {}),
            Transition::Reset => state.apply(report_id, transition, |d| {
                d.attempt_count = 0;
                d.record_count_actual = None;
                d.import_completed_at = None;
                d.last_error = None;
            }),
            other => Err(Error::InvalidInput(format!(
                "{} is not an operator transition",
                other.name()
            ))),
        }
    }

    async fn reset_needs_review(&self, filter: &SelectionFilter) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let ids: Vec<String> = state
            .descriptors
            .values()
            .filter(|d| d.import_status == ImportStatus::NeedsReview && filter.matches(d))
            .map(|d| d.report_id.clone())
            .collect();

        for id in &ids {
            state.apply(id, Transition::Retry, |d| d.attempt_count = 0)?;
        }
        Ok(ids)
    }

    async fn set_session_date(
        &self,
        report_id: &str,
        date: NaiveDate,
        source: DateSource,
    ) -> Result<SessionDescriptor> {
        let mut state = self.state.lock().await;
        let existing = state
            .descriptors
            .get(report_id)
            .ok_or_else(|| Error::NotFound(format!("session descriptor {}", report_id)))?;

        let incoming = DescriptorUpsert {
            report_id: report_id.to_string(),
            session_date: Some(date),
            date_source: source,
            ..DescriptorUpsert::default()
        };
        let merged = merge_descriptor(existing, &incoming, now());
        if merged.changed {
            state
                .descriptors
                .insert(report_id.to_string(), merged.descriptor.clone());
        }
        Ok(merged.descriptor)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for descriptor in state.descriptors.values() {
            counts.add(descriptor.import_status, 1);
            if descriptor.date_flagged {
                counts.date_flagged += 1;
            }
        }
        Ok(counts)
    }

    async fn count_run_outcomes(&self, run_id: &str) -> Result<RunOutcomeCounts> {
        let state = self.state.lock().await;
        let mut counts = RunOutcomeCounts::default();
        for descriptor in state
            .descriptors
            .values()
            .filter(|d| d.last_run_id.as_deref() == Some(run_id))
        {
            counts.add(descriptor.import_status, 1);
        }
        Ok(counts)
    }

    async fn create_run(&self, run: &BackfillRun) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.runs.iter().any(|r| r.run_id == run.run_id) {
            return Err(Error::Conflict(format!("backfill run {} already exists", run.run_id)));
        }
        if run.status == RunStatus::Running {
            if let Some(active) = state.running_run_other_than(&run.run_id) {
                return Err(Error::Conflict(format!(
                    "cannot mark run {} running: run {} is already running",
                    run.run_id, active.run_id
                )));
            }
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &BackfillRun) -> Result<()> {
        let mut state = self.state.lock().await;
        if run.status == RunStatus::Running {
            if let Some(active) = state.running_run_other_than(&run.run_id) {
                return Err(Error::Conflict(format!(
                    "cannot mark run {} running: run {} is already running",
                    run.run_id, active.run_id
                )));
            }
        }

        let slot = state
            .runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id)
            .ok_or_else(|| Error::NotFound(format!("backfill run {}", run.run_id)))?;
        *slot = run.clone();
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<BackfillRun>> {
        let state = self.state.lock().await;
        Ok(state.runs.iter().find(|r| r.run_id == run_id).cloned())
    }

    async fn latest_resumable_run(&self) -> Result<Option<BackfillRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .find(|r| r.status.is_resumable())
            .cloned())
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<BackfillRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
