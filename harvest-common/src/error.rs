//! Common error types for Harvest

use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Common result type for Harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the Harvest crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation rejected because it conflicts with current state
    /// (illegal status transition, a run already active, ...)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store write still blocked by another writer when the lock budget ran out
    #[error("{operation}: database still locked after {attempts} attempts ({waited_ms} ms)")]
    Locked {
        operation: String,
        attempts: u32,
        waited_ms: u64,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for SQLITE_BUSY / SQLITE_LOCKED, including extended codes
    pub fn is_lock_contention(&self) -> bool {
        let Error::Database(db_err) = self else {
            return false;
        };
        let coded = db_err
            .as_database_error()
            .and_then(|e| e.code())
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED));
        match coded {
            Some(locked) => locked,
            None => db_err.to_string().contains("database is locked"),
        }
    }
}
