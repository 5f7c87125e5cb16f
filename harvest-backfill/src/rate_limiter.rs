//! Token-bucket rate limiter shared by discovery and import calls
//!
//! The portal enforces an unpublished request quota across every call we make,
//! so one `Arc<RateLimiter>` is handed to both the discoverer and the
//! orchestrator. State lives in memory only and starts with a full bucket.
//!
//! Rates always carry their time base: there is no constructor taking a bare
//! number. An hourly quota of 6 is `RefillRate::per_hour(6.0)`, which is
//! 6/3600 tokens per second internally.

use crate::error::{BackfillError, BackfillResult};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Tolerance for floating point refill arithmetic
const TOKEN_EPSILON: f64 = 1e-9;

/// Slowest accepted refill is one token per this many seconds
const SLOWEST_REFILL_SECS: f64 = 86_400.0;

/// Shortest sleep between refill checks
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Unit a refill amount is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    Second,
    Minute,
    Hour,
}

impl TimeBase {
    pub fn seconds(&self) -> f64 {
        match self {
            TimeBase::Second => 1.0,
            TimeBase::Minute => 60.0,
            TimeBase::Hour => 3600.0,
        }
    }
}

/// Refill rate, held as tokens per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefillRate {
    tokens_per_second: f64,
}

impl RefillRate {
    /// `amount` tokens added every `per`; anything slower than one token a
    /// day is rejected
    pub fn new(amount: f64, per: TimeBase) -> BackfillResult<Self> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(BackfillError::Config(format!(
                "refill amount must be a positive number, got {}",
                amount
            )));
        }
        let tokens_per_second = amount / per.seconds();
        if tokens_per_second * SLOWEST_REFILL_SECS + TOKEN_EPSILON < 1.0 {
            return Err(BackfillError::Config(format!(
                "refill rate {} per {:?} is slower than one request per day",
                amount, per
            )));
        }
        Ok(Self { tokens_per_second })
    }

    pub fn per_second(amount: f64) -> BackfillResult<Self> {
        Self::new(amount, TimeBase::Second)
    }

    pub fn per_minute(amount: f64) -> BackfillResult<Self> {
        Self::new(amount, TimeBase::Minute)
    }

    pub fn per_hour(amount: f64) -> BackfillResult<Self> {
        Self::new(amount, TimeBase::Hour)
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second
    }

    /// Time needed to accumulate `tokens`
    fn time_for(&self, tokens: f64) -> Duration {
        harvest_common::time::secs_f64_to_duration(tokens / self.tokens_per_second)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket; `acquire` waiters are served in arrival order
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    rate: RefillRate,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(capacity: u32, rate: RefillRate) -> BackfillResult<Self> {
        if capacity == 0 {
            return Err(BackfillError::Config(
                "rate limit capacity must be at least 1".to_string(),
            ));
        }

        let capacity = f64::from(capacity);
        Ok(Self {
            capacity,
            rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Limiter for a quota stated as requests per hour
    pub fn from_hourly_quota(requests_per_hour: f64, capacity: u32) -> BackfillResult<Self> {
        Self::new(capacity, RefillRate::per_hour(requests_per_hour)?)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_rate(&self) -> RefillRate {
        self.rate
    }

    /// Wait until a token is available, then consume it
    ///
    /// The bucket lock is held while sleeping, so later callers queue behind
    /// earlier ones. Dropping the future mid-wait consumes nothing.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        loop {
            self.refill(&mut state);

            if state.tokens + TOKEN_EPSILON >= 1.0 {
                state.tokens = (state.tokens - 1.0).max(0.0);
                return;
            }

            let wait = self.rate.time_for(1.0 - state.tokens).max(MIN_WAIT);
            tracing::debug!(
                wait_ms = wait.as_millis() as u64,
                tokens = state.tokens,
                "Rate limiting: waiting for token"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a token if one is available right now
    ///
    /// Returns false while another caller is waiting in `acquire`.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.state.try_lock() else {
            return false;
        };

        self.refill(&mut state);
        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Current token count after refill
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate.tokens_per_second).min(self.capacity);
        state.last_refill = now;
    }
}
