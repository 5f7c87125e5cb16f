//! SQLite access for descriptors and runs
//!
//! Plain functions over a `SqlitePool`; schema creation lives in
//! `harvest_common::db`. Lock retries are applied by the store layer.

pub mod descriptors;
pub mod runs;
