//! Configuration for harvest-backfill
//!
//! The TOML file extends the shared bootstrap config (`root_folder`,
//! `[logging]`, `[database]`) with collaborator endpoints and the
//! `[discovery]` / `[backfill]` sections:
//!
//! ```toml
//! [portal]
//! base_url = "https://portal.example.com/api"
//!
//! [importer]
//! base_url = "http://localhost:5740"
//!
//! [backfill]
//! date_start = "2023-01-01"
//! tag_filter = ["league"]
//! max_sessions_per_run = 50
//! checkpoint_interval = 5
//! max_retries = 3
//! backoff_base_seconds = 10.0
//! backoff_multiplier = 3.0
//! order = "oldest_first"
//!
//! [backfill.rate_limit]
//! capacity = 1
//! requests_per_hour = 360
//! ```
//!
//! Loose TOML values are validated into [`RunConfig`] and a [`RateLimiter`]
//! before anything touches the store.

use crate::backoff::{BackoffPolicy, MAX_RETRY_DELAY};
use crate::error::{BackfillError, BackfillResult};
use crate::models::{SelectionFilter, SelectionOrder};
use crate::rate_limiter::{RateLimiter, RefillRate, TimeBase};
use chrono::NaiveDate;
use harvest_common::config::TomlConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Full configuration file for the backfill binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub common: TomlConfig,

    #[serde(default)]
    pub portal: EndpointSettings,

    #[serde(default)]
    pub importer: EndpointSettings,

    #[serde(default)]
    pub notify: NotifySettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub backfill: BackfillSettings,
}

impl AppConfig {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> BackfillResult<Self> {
        harvest_common::config::load_toml_file(path).map_err(|e| BackfillError::Config(e.to_string()))
    }
}

/// HTTP collaborator endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSettings {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EndpointSettings {
    /// Base URL, or a configuration error naming the section
    pub fn require_base_url(&self, section: &str) -> BackfillResult<&str> {
        self.base_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| BackfillError::Config(format!("[{}] base_url is not set", section)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Terminal run event delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySettings {
    /// POST run events here; events are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Discovery paging limits and page retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    #[serde(default)]
    pub max_pages: Option<u32>,

    #[serde(default)]
    pub max_results: Option<u32>,

    /// Attempts per page before discovery stops with partial results
    #[serde(default = "default_page_attempts")]
    pub page_attempts: u32,

    #[serde(default = "default_page_retry_delay_seconds")]
    pub page_retry_delay_seconds: f64,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_pages: None,
            max_results: None,
            page_attempts: default_page_attempts(),
            page_retry_delay_seconds: default_page_retry_delay_seconds(),
        }
    }
}

impl DiscoverySettings {
    /// Pause between attempts at one page, capped like import backoff
    pub fn page_retry_delay(&self) -> Duration {
        harvest_common::time::secs_f64_to_duration(self.page_retry_delay_seconds)
            .min(MAX_RETRY_DELAY)
    }
}

/// Largest accepted `backoff_multiplier`
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// `[backfill]` section as written by the operator
///
/// Numeric fields are signed so that a negative value reaches validation
/// and produces a readable error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillSettings {
    #[serde(default)]
    pub date_start: Option<NaiveDate>,

    #[serde(default)]
    pub date_end: Option<NaiveDate>,

    #[serde(default)]
    pub tag_filter: Vec<String>,

    #[serde(default)]
    pub max_sessions_per_run: Option<i64>,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: i64,

    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: f64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default)]
    pub order: SelectionOrder,

    #[serde(default)]
    pub dry_run: bool,

    /// Omitted section means one request every 10 seconds
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            date_start: None,
            date_end: None,
            tag_filter: Vec::new(),
            max_sessions_per_run: None,
            checkpoint_interval: default_checkpoint_interval(),
            max_retries: default_max_retries(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            order: SelectionOrder::default(),
            dry_run: false,
            rate_limit: None,
        }
    }
}

impl BackfillSettings {
    /// Validate into the typed run configuration
    pub fn to_run_config(&self) -> BackfillResult<RunConfig> {
        if self.max_retries < 0 {
            return Err(BackfillError::Config(format!(
                "max_retries must be >= 0, got {}",
                self.max_retries
            )));
        }
        let max_retries = u32::try_from(self.max_retries).map_err(|_| {
            BackfillError::Config(format!("max_retries {} is too large", self.max_retries))
        })?;

        if self.checkpoint_interval <= 0 {
            return Err(BackfillError::Config(format!(
                "checkpoint_interval must be >= 1, got {}",
                self.checkpoint_interval
            )));
        }

        let max_sessions_per_run = match self.max_sessions_per_run {
            Some(n) if n <= 0 => {
                return Err(BackfillError::Config(format!(
                    "max_sessions_per_run must be >= 1, got {}",
                    n
                )))
            }
            Some(n) => Some(n as u64),
            None => None,
        };

        let config = RunConfig {
            filter: SelectionFilter {
                date_start: self.date_start,
                date_end: self.date_end,
                tags: self
                    .tag_filter
                    .iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
                report_ids: None,
            },
            max_sessions_per_run,
            checkpoint_interval: self.checkpoint_interval as u64,
            max_retries,
            backoff_base_seconds: self.backoff_base_seconds,
            backoff_multiplier: self.backoff_multiplier,
            order: self.order,
            dry_run: self.dry_run,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the shared limiter from `[backfill.rate_limit]`
    pub fn rate_limiter(&self) -> BackfillResult<RateLimiter> {
        match &self.rate_limit {
            Some(settings) => settings.build(),
            None => RateLimiter::new(1, RefillRate::per_second(0.1)?),
        }
    }
}

/// `[backfill.rate_limit]`: capacity plus exactly one rate key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSettings {
    #[serde(default = "default_capacity")]
    pub capacity: i64,

    #[serde(default)]
    pub refill_rate_per_second: Option<f64>,

    #[serde(default)]
    pub requests_per_minute: Option<f64>,

    #[serde(default)]
    pub requests_per_hour: Option<f64>,
}

impl RateLimitSettings {
    /// The configured rate with its unit; exactly one key must be present
    pub fn refill_rate(&self) -> BackfillResult<RefillRate> {
        let keyed = [
            ("refill_rate_per_second", self.refill_rate_per_second, TimeBase::Second),
            ("requests_per_minute", self.requests_per_minute, TimeBase::Minute),
            ("requests_per_hour", self.requests_per_hour, TimeBase::Hour),
        ];
        let present: Vec<_> = keyed
            .iter()
            .filter_map(|(name, value, base)| value.map(|v| (*name, v, *base)))
            .collect();

        match present.as_slice() {
            [(_, amount, base)] => RefillRate::new(*amount, *base),
            [] => Err(BackfillError::Config(
                "rate_limit needs one of refill_rate_per_second, requests_per_minute, requests_per_hour"
                    .to_string(),
            )),
            many => {
                let names: Vec<&str> = many.iter().map(|(name, _, _)| *name).collect();
                Err(BackfillError::Config(format!(
                    "rate_limit is ambiguous: {} are all set",
                    names.join(", ")
                )))
            }
        }
    }

    pub fn build(&self) -> BackfillResult<RateLimiter> {
        if self.capacity <= 0 {
            return Err(BackfillError::Config(format!(
                "rate_limit capacity must be >= 1, got {}",
                self.capacity
            )));
        }
        let capacity = u32::try_from(self.capacity).map_err(|_| {
            BackfillError::Config(format!("rate_limit capacity {} is too large", self.capacity))
        })?;
        RateLimiter::new(capacity, self.refill_rate()?)
    }
}

/// Validated run configuration; persisted as the run's `config_snapshot`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub filter: SelectionFilter,
    pub max_sessions_per_run: Option<u64>,
    pub checkpoint_interval: u64,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub backoff_multiplier: f64,
    pub order: SelectionOrder,
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            filter: SelectionFilter::default(),
            max_sessions_per_run: None,
            checkpoint_interval: default_checkpoint_interval() as u64,
            max_retries: default_max_retries() as u32,
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_multiplier: default_backoff_multiplier(),
            order: SelectionOrder::default(),
            dry_run: false,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> BackfillResult<()> {
        if self.checkpoint_interval == 0 {
            return Err(BackfillError::Config(
                "checkpoint_interval must be >= 1".to_string(),
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.backoff_multiplier) {
            return Err(BackfillError::Config(format!(
                "backoff_multiplier must be between 1.0 and {}, got {}",
                MAX_BACKOFF_MULTIPLIER, self.backoff_multiplier
            )));
        }
        let max_base = MAX_RETRY_DELAY.as_secs_f64();
        if !(0.0..=max_base).contains(&self.backoff_base_seconds) {
            return Err(BackfillError::Config(format!(
                "backoff_base_seconds must be between 0 and {}, got {}",
                max_base, self.backoff_base_seconds
            )));
        }
        if self.max_sessions_per_run == Some(0) {
            return Err(BackfillError::Config(
                "max_sessions_per_run must be >= 1".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.filter.date_start, self.filter.date_end) {
            if start > end {
                return Err(BackfillError::Config(format!(
                    "date_start {} is after date_end {}",
                    start, end
                )));
            }
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_retries,
            harvest_common::time::secs_f64_to_duration(self.backoff_base_seconds),
            self.backoff_multiplier,
        )
    }

    /// Same settings restricted to an explicit id set
    pub fn for_report_ids(&self, ids: BTreeSet<String>) -> Self {
        let mut config = self.clone();
        config.filter.report_ids = Some(ids);
        config
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_attempts() -> u32 {
    3
}

fn default_page_retry_delay_seconds() -> f64 {
    2.0
}

fn default_checkpoint_interval() -> i64 {
    5
}

fn default_max_retries() -> i64 {
    3
}

fn default_backoff_base_seconds() -> f64 {
    10.0
}

fn default_backoff_multiplier() -> f64 {
    3.0
}

fn default_capacity() -> i64 {
    1
}
