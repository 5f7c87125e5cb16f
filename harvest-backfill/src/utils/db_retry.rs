//! SQLite lock retry for store writes
//!
//! Discovery and a backfill run may write the same database file from two
//! processes. Under WAL the second writer can still get `SQLITE_BUSY` once
//! `busy_timeout` expires; [`LockRetry`] re-runs the whole write transaction
//! until it commits or the `[database] max_lock_wait_ms` budget is spent.

use crate::models::Transition;
use harvest_common::{Error, Result};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Pause before each re-run; the last step repeats
const RETRY_STEPS_MS: [u64; 5] = [5, 20, 50, 100, 250];

/// Store write being retried, for log fields and the final error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Upsert,
    Transition(Transition),
    ResetNeedsReview,
    SetSessionDate,
    CreateRun,
    SaveRun,
}

impl StoreOp {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreOp::Upsert => "upsert",
            StoreOp::Transition(_) => "transition",
            StoreOp::ResetNeedsReview => "bulk_reset",
            StoreOp::SetSessionDate => "set_date",
            StoreOp::CreateRun | StoreOp::SaveRun => "run",
        }
    }
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::Transition(t) => write!(f, "transition '{}'", t.name()),
            StoreOp::Upsert => f.write_str("descriptor upsert"),
            StoreOp::ResetNeedsReview => f.write_str("needs_review reset"),
            StoreOp::SetSessionDate => f.write_str("session date update"),
            StoreOp::CreateRun => f.write_str("run insert"),
            StoreOp::SaveRun => f.write_str("run update"),
        }
    }
}

/// Lock wait budget shared by every write of one store
#[derive(Debug, Clone, Copy)]
pub struct LockRetry {
    budget: Duration,
}

impl LockRetry {
    pub fn new(max_lock_wait_ms: u64) -> Self {
        Self {
            budget: Duration::from_millis(max_lock_wait_ms),
        }
    }

    /// Run `transaction` until it commits, fails for a reason other than
    /// lock contention, or the budget is spent
    ///
    /// `transaction` must be the complete write: a retry starts it over.
    pub async fn write<F, Fut, T>(&self, op: StoreOp, mut transaction: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + self.budget;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match transaction().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::debug!(
                            op = %op,
                            kind = op.kind(),
                            attempts,
                            "Store write committed after lock wait"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if err.is_lock_contention() => err,
                Err(err) => return Err(err),
            };

            let now = Instant::now();
            if now >= deadline {
                let waited_ms = (now - started).as_millis() as u64;
                tracing::error!(
                    op = %op,
                    kind = op.kind(),
                    attempts,
                    waited_ms,
                    error = %err,
                    "Store write abandoned: database stayed locked"
                );
                return Err(Error::Locked {
                    operation: op.to_string(),
                    attempts,
                    waited_ms,
                });
            }

            let step = RETRY_STEPS_MS[(attempts as usize - 1).min(RETRY_STEPS_MS.len() - 1)];
            let pause = Duration::from_millis(step).min(deadline - now);
            tracing::warn!(
                op = %op,
                kind = op.kind(),
                attempts,
                pause_ms = pause.as_millis() as u64,
                "Database locked, re-running store write"
            );
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn locked() -> Error {
        Error::Database(sqlx::Error::Protocol("database is locked".to_string()))
    }

    #[tokio::test]
    async fn test_first_attempt_commits() {
        let retry = LockRetry::new(5000);
        let result = retry.write(StoreOp::Upsert, || async { Ok::<i32, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_write_is_rerun() {
        let retry = LockRetry::new(5000);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = retry
            .write(StoreOp::Transition(Transition::Begin), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(locked())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_spent_returns_locked() {
        let retry = LockRetry::new(50);
        let started = Instant::now();

        let result = retry
            .write(StoreOp::SaveRun, || async { Err::<i32, Error>(locked()) })
            .await;

        match result.unwrap_err() {
            Error::Locked {
                operation,
                attempts,
                waited_ms,
            } => {
                assert_eq!(operation, "run update");
                assert!(attempts > 1);
                assert!(waited_ms >= 50);
            }
            other => panic!("expected Locked, got {other:?}"),
        }
        // Last pause is clamped to the deadline
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let retry = LockRetry::new(5000);
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let result = retry
            .write(StoreOp::CreateRun, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, Error>(Error::Conflict("run already active".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_op_labels() {
        assert_eq!(StoreOp::Transition(Transition::GiveUp).to_string(), "transition 'give up'");
        assert_eq!(StoreOp::Transition(Transition::Skip).kind(), "transition");
        assert_eq!(StoreOp::Upsert.kind(), "upsert");
    }
}
