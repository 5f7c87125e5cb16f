//! Error types for harvest-backfill
//!
//! Per-descriptor failures (`ImportError`, `PortalError`) never abort a run and
//! live next to their collaborators. `BackfillError` covers what does stop an
//! operation: bad configuration, integrity problems and store failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackfillError {
    /// Rejected at construction; nothing was touched
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state is inconsistent (resume cursor missing, snapshot unreadable)
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("No resumable backfill run (no run is running or paused)")]
    NoResumableRun,

    /// Another run already holds the single `running` slot
    #[error("Backfill run {0} is already active")]
    RunAlreadyActive(String),

    #[error("Store error: {0}")]
    Store(#[from] harvest_common::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for orchestration and discovery operations
pub type BackfillResult<T> = Result<T, BackfillError>;
