//! Test Helper Utilities
//!
//! Shared fixtures for the harvest-backfill integration tests

#![allow(dead_code)]

pub mod fakes;
pub mod log_capture;
pub mod store_utils;

pub use fakes::{raw, RecordingNotifier, ScriptedImporter, ScriptedPortal};
pub use log_capture::LogCapture;
pub use store_utils::{
    date, memory_store, seed_sequential, sqlite_store, status_of, unlimited, upsert, FaultyStore,
};
