//! # Harvest Common Library
//!
//! Shared code for the Harvest crates:
//! - Error type
//! - Bootstrap configuration loading and root folder resolution
//! - SQLite initialization and schema
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
