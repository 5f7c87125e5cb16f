//! SQLite-backed store
//!
//! Every write goes through [`LockRetry`] so that discovery and a backfill
//! run in separate processes can share one database file. Reads are not
//! retried.

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_common::config::DatabaseConfig;
use harvest_common::time::now;
use harvest_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

use super::{DiscoveryStore, RunOutcomeCounts, StatusCounts, UpsertOutcome};
use crate::db::{descriptors, runs};
use crate::models::{
    BackfillRun, DateSource, DescriptorUpsert, ImportStatus, SelectionFilter, SessionDescriptor,
    Transition,
};
use crate::utils::{LockRetry, StoreOp};

#[derive(Debug, Clone)]
pub struct SqliteDiscoveryStore {
    pool: SqlitePool,
    lock_retry: LockRetry,
}

impl SqliteDiscoveryStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            lock_retry: LockRetry::new(max_lock_wait_ms),
        }
    }

    /// Open (creating if needed) the database file and its tables
    pub async fn open(db_path: &Path, config: &DatabaseConfig) -> Result<Self> {
        let pool = harvest_common::db::init_database(db_path, config).await?;
        Ok(Self::new(pool, config.max_lock_wait_ms))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DiscoveryStore for SqliteDiscoveryStore {
    async fn upsert_descriptor(&self, incoming: &DescriptorUpsert) -> Result<UpsertOutcome> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Upsert, || async {
            descriptors::upsert_descriptor(pool, incoming, now()).await
        })
        .await
    }

    async fn get_descriptor(&self, report_id: &str) -> Result<Option<SessionDescriptor>> {
        descriptors::get_descriptor(&self.pool, report_id).await
    }

    async fn list_descriptors(
        &self,
        status: Option<ImportStatus>,
    ) -> Result<Vec<SessionDescriptor>> {
        descriptors::list_descriptors(&self.pool, status).await
    }

    async fn select_candidates(&self, filter: &SelectionFilter) -> Result<Vec<SessionDescriptor>> {
        descriptors::select_candidates(&self.pool, filter).await
    }

    async fn begin_import(
        &self,
        report_id: &str,
        run_id: &str,
    ) -> Result<Option<SessionDescriptor>> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Transition(Transition::Begin), || async {
            descriptors::begin_import(pool, report_id, run_id, now()).await
        })
        .await
    }

    async fn release_import(&self, report_id: &str) -> Result<SessionDescriptor> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Transition(Transition::Release), || async {
            descriptors::release_import(pool, report_id, now()).await
        })
        .await
    }

    async fn complete_import(
        &self,
        report_id: &str,
        record_count: i64,
    ) -> Result<SessionDescriptor> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Transition(Transition::Succeed), || async {
            descriptors::complete_import(pool, report_id, record_count, now()).await
        })
        .await
    }

    async fn record_failure(
        &self,
        report_id: &str,
        error: &str,
        requeue: bool,
    ) -> Result<SessionDescriptor> {
        let pool = &self.pool;
        let edge = if requeue {
            Transition::Requeue
        } else {
            Transition::GiveUp
        };
        self.lock_retry.write(StoreOp::Transition(edge), || async {
            descriptors::record_failure(pool, report_id, error, requeue, now()).await
        })
        .await
    }

    async fn recover_in_flight(&self) -> Result<Vec<String>> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Transition(Transition::Recover), || async {
            descriptors::recover_in_flight(pool, now()).await
        })
        .await
    }

    async fn apply_operator_transition(
        &self,
        report_id: &str,
        transition: Transition,
    ) -> Result<SessionDescriptor> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::Transition(transition), || async {
            descriptors::apply_operator_transition(pool, report_id, transition, now()).await
        })
        .await
    }

    async fn reset_needs_review(&self, filter: &SelectionFilter) -> Result<Vec<String>> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::ResetNeedsReview, || async {
            descriptors::reset_needs_review(pool, filter, now()).await
        })
        .await
    }

    async fn set_session_date(
        &self,
        report_id: &str,
        date: NaiveDate,
        source: DateSource,
    ) -> Result<SessionDescriptor> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::SetSessionDate, || async {
            descriptors::set_session_date(pool, report_id, date, source, now()).await
        })
        .await
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        descriptors::status_counts(&self.pool).await
    }

    async fn count_run_outcomes(&self, run_id: &str) -> Result<RunOutcomeCounts> {
        descriptors::count_run_outcomes(&self.pool, run_id).await
    }

    async fn create_run(&self, run: &BackfillRun) -> Result<()> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::CreateRun, || async {
            runs::insert_run(pool, run).await
        })
        .await
    }

    async fn save_run(&self, run: &BackfillRun) -> Result<()> {
        let pool = &self.pool;
        self.lock_retry.write(StoreOp::SaveRun, || async {
            runs::update_run(pool, run).await
        })
        .await
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<BackfillRun>> {
        runs::get_run(&self.pool, run_id).await
    }

    async fn latest_resumable_run(&self) -> Result<Option<BackfillRun>> {
        runs::latest_resumable_run(&self.pool).await
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<BackfillRun>> {
        runs::list_runs(&self.pool, limit).await
    }
}
