//! Utility modules for harvest-backfill

pub mod db_retry;

pub use db_retry::{LockRetry, StoreOp};
