//! harvest-backfill library interface
//!
//! Historical session backfill: discover sessions from the portal listing,
//! then import them under a shared rate limit with retry, checkpoint and
//! resume. The binary in `main.rs` is a thin CLI over these modules;
//! integration tests drive them directly.

pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod rate_limiter;
pub mod services;
pub mod store;
pub mod utils;

pub use crate::error::{BackfillError, BackfillResult};
