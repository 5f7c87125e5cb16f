//! Store fixtures

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use harvest_backfill::models::{
    BackfillRun, DateSource, DescriptorUpsert, ImportStatus, SelectionFilter, SessionDescriptor,
    Transition,
};
use harvest_backfill::rate_limiter::{RateLimiter, RefillRate};
use harvest_backfill::store::{
    DiscoveryStore, MemoryDiscoveryStore, RunOutcomeCounts, SqliteDiscoveryStore, StatusCounts,
    UpsertOutcome,
};
use harvest_common::config::DatabaseConfig;
use harvest_common::{Error, Result};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Listing-dated upsert
pub fn upsert(report_id: &str, session_date: Option<NaiveDate>) -> DescriptorUpsert {
    DescriptorUpsert {
        report_id: report_id.to_string(),
        access_key: format!("key-{}", report_id),
        display_name: Some(format!("Session {}", report_id)),
        session_date,
        date_source: if session_date.is_some() {
            DateSource::Listing
        } else {
            DateSource::None
        },
        ..DescriptorUpsert::default()
    }
}

/// Seed `count` pending rows `S01..` dated one day apart from 2023-01-01
pub async fn seed_sequential(store: &dyn DiscoveryStore, count: u32) -> Vec<String> {
    let start = date(2023, 1, 1);
    let mut ids = Vec::new();
    for i in 1..=count {
        let id = format!("S{:02}", i);
        let day = start + chrono::Duration::days(i64::from(i) - 1);
        store.upsert_descriptor(&upsert(&id, Some(day))).await.unwrap();
        ids.push(id);
    }
    ids
}

pub async fn status_of(store: &dyn DiscoveryStore, report_id: &str) -> ImportStatus {
    store
        .get_descriptor(report_id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("{} missing", report_id))
        .import_status
}

pub fn memory_store() -> Arc<MemoryDiscoveryStore> {
    Arc::new(MemoryDiscoveryStore::new())
}

/// SQLite store on a temp file; keep the `TempDir` alive for the test
pub async fn sqlite_store() -> (TempDir, Arc<SqliteDiscoveryStore>) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("harvest.db");
    let store = SqliteDiscoveryStore::open(&db_path, &DatabaseConfig::default())
        .await
        .unwrap();
    (temp_dir, Arc::new(store))
}

/// Limiter that never makes a test wait
pub fn unlimited() -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(1000, RefillRate::per_second(1000.0).unwrap()).unwrap())
}

/// Memory store whose `complete_import` can be made to fail
pub struct FaultyStore {
    inner: MemoryDiscoveryStore,
    fail_completions: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryDiscoveryStore::new(),
            fail_completions: AtomicBool::new(false),
        }
    }

    pub fn fail_completions(&self) {
        self.fail_completions.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DiscoveryStore for FaultyStore {
    async fn upsert_descriptor(&self, incoming: &DescriptorUpsert) -> Result<UpsertOutcome> {
        self.inner.upsert_descriptor(incoming).await
    }

    async fn get_descriptor(&self, report_id: &str) -> Result<Option<SessionDescriptor>> {
        self.inner.get_descriptor(report_id).await
    }

    async fn list_descriptors(
        &self,
        status: Option<ImportStatus>,
    ) -> Result<Vec<SessionDescriptor>> {
        self.inner.list_descriptors(status).await
    }

    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<SessionDescriptor>> {
        self.inner.select_candidates(filter).await
    }

    async fn begin_import(
        &self,
        report_id: &str,
        run_id: &str,
    ) -> Result<Option<SessionDescriptor>> {
        self.inner.begin_import(report_id, run_id).await
    }

    async fn release_import(&self, report_id: &str) -> Result<SessionDescriptor> {
        self.inner.release_import(report_id).await
    }

    async fn complete_import(
        &self,
        report_id: &str,
        record_count: i64,
    ) -> Result<SessionDescriptor> {
        if self.fail_completions.load(Ordering::SeqCst) {
            return Err(Error::Internal("disk full".to_string()));
        }
        self.inner.complete_import(report_id, record_count).await
    }

    async fn record_failure(
        &self,
        report_id: &str,
        error: &str,
        requeue: bool,
    ) -> Result<SessionDescriptor> {
        self.inner.record_failure(report_id, error, requeue).await
    }

    async fn recover_in_flight(&self) -> Result<Vec<String>> {
        self.inner.recover_in_flight().await
    }

    async fn apply_operator_transition(
        &self,
        report_id: &str,
        transition: Transition,
    ) -> Result<SessionDescriptor> {
        self.inner
            .apply_operator_transition(report_id, transition)
            .await
    }

    async fn reset_needs_review(&self, filter: &SelectionFilter) -> Result<Vec<String>> {
        self.inner.reset_needs_review(filter).await
    }

    async fn set_session_date(
        &self,
        report_id: &str,
        date: NaiveDate,
        source: DateSource,
    ) -> Result<SessionDescriptor> {
        self.inner.set_session_date(report_id, date, source).await
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        self.inner.status_counts().await
    }

    async fn count_run_outcomes(&self, run_id: &str) -> Result<RunOutcomeCounts> {
        self.inner.count_run_outcomes(run_id).await
    }

    async fn create_run(&self, run: &BackfillRun) -> Result<()> {
        self.inner.create_run(run).await
    }

    async fn save_run(&self, run: &BackfillRun) -> Result<()> {
        self.inner.save_run(run).await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<BackfillRun>> {
        self.inner.get_run(run_id).await
    }

    async fn latest_resumable_run(&self) -> Result<Option<BackfillRun>> {
        self.inner.latest_resumable_run().await
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<BackfillRun>> {
        self.inner.list_runs(limit).await
    }
}
