//! Session discovery
//!
//! Walks the portal listing page by page, normalizes each row and upserts it
//! as `pending`. Re-running discovery over the same pages is harmless: rows
//! are keyed on `report_id` and merged, never duplicated.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::normalize::normalize;
use super::portal_client::{PortalClient, PortalPage};
use crate::error::BackfillResult;
use crate::rate_limiter::RateLimiter;
use crate::store::{DiscoveryStore, UpsertOutcome};

const DEFAULT_PAGE_ATTEMPTS: u32 = 3;
const DEFAULT_PAGE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Caller-supplied bounds on one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryFilters {
    pub max_pages: Option<u32>,
    /// Valid rows (new or known) to accept before stopping
    pub max_results: Option<u32>,
}

/// Why a discovery pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The portal reported no further pages
    Exhausted,
    MaxPages,
    MaxResults,
    /// A page kept failing; earlier pages are kept
    PageFailed,
    /// The portal handed back a page token it had already given
    RepeatedPageToken,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub new: u64,
    pub known: u64,
    /// Known rows whose stored fields changed
    pub updated: u64,
    /// Rows skipped because normalization found no id or key
    pub invalid: u64,
    /// Rows whose stored descriptor carries the date disagreement flag
    pub date_flagged: u64,
    pub pages_fetched: u32,
    pub stop_reason: StopReason,
    /// Last page error when `stop_reason` is `PageFailed` or `RepeatedPageToken`
    pub last_error: Option<String>,
}

impl DiscoveryReport {
    fn empty() -> Self {
        Self {
            new: 0,
            known: 0,
            updated: 0,
            invalid: 0,
            date_flagged: 0,
            pages_fetched: 0,
            stop_reason: StopReason::Exhausted,
            last_error: None,
        }
    }

    fn accepted(&self) -> u64 {
        self.new + self.known
    }

    /// Partial results: the pass stopped before the listing was exhausted
    pub fn is_partial(&self) -> bool {
        matches!(
            self.stop_reason,
            StopReason::PageFailed | StopReason::RepeatedPageToken | StopReason::Cancelled
        )
    }
}

enum PageFetch {
    Fetched(PortalPage),
    Failed(String),
    Cancelled,
}

pub struct SessionDiscoverer {
    portal: Arc<dyn PortalClient>,
    store: Arc<dyn DiscoveryStore>,
    limiter: Arc<RateLimiter>,
    page_attempts: u32,
    page_retry_delay: Duration,
}

impl SessionDiscoverer {
    pub fn new(
        portal: Arc<dyn PortalClient>,
        store: Arc<dyn DiscoveryStore>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            portal,
            store,
            limiter,
            page_attempts: DEFAULT_PAGE_ATTEMPTS,
            page_retry_delay: DEFAULT_PAGE_RETRY_DELAY,
        }
    }

    /// Override the per-page retry policy (attempts are clamped to at least 1)
    pub fn with_page_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.page_attempts = attempts.max(1);
        self.page_retry_delay = delay;
        self
    }

    /// Run one discovery pass
    ///
    /// Only store failures are errors; page failures and cancellation end
    /// the pass early and are reported in [`DiscoveryReport::stop_reason`].
    pub async fn discover(
        &self,
        filters: &DiscoveryFilters,
        cancel: &CancellationToken,
    ) -> BackfillResult<DiscoveryReport> {
        let mut report = DiscoveryReport::empty();
        let mut page_token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        tracing::info!(
            max_pages = ?filters.max_pages,
            max_results = ?filters.max_results,
            "Starting session discovery"
        );

        let stop_reason = 'pages: loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if filters
                .max_pages
                .is_some_and(|max| report.pages_fetched >= max)
            {
                break StopReason::MaxPages;
            }

            let page = match self.fetch_with_retry(page_token.as_deref(), cancel).await {
                PageFetch::Fetched(page) => page,
                PageFetch::Cancelled => break StopReason::Cancelled,
                PageFetch::Failed(error) => {
                    report.last_error = Some(error);
                    break StopReason::PageFailed;
                }
            };
            report.pages_fetched += 1;

            for raw in &page.descriptors {
                if filters
                    .max_results
                    .is_some_and(|max| report.accepted() >= u64::from(max))
                {
                    break 'pages StopReason::MaxResults;
                }

                let incoming = match normalize(raw) {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        tracing::warn!(
                            raw_id = %raw.raw_id_or_url,
                            error = %e,
                            "Skipping invalid listing row"
                        );
                        report.invalid += 1;
                        continue;
                    }
                };

                let outcome = self.store.upsert_descriptor(&incoming).await?;
                match &outcome {
                    UpsertOutcome::Created(_) => report.new += 1,
                    UpsertOutcome::Existing { changed, .. } => {
                        report.known += 1;
                        if *changed {
                            report.updated += 1;
                        }
                    }
                }

                let stored = outcome.descriptor();
                if stored.date_flagged {
                    tracing::warn!(
                        report_id = %stored.report_id,
                        session_date = ?stored.session_date,
                        "Date sources disagree; descriptor flagged for review"
                    );
                    report.date_flagged += 1;
                }
            }

            tracing::info!(
                page = report.pages_fetched,
                rows = page.descriptors.len(),
                new = report.new,
                known = report.known,
                "Discovery page processed"
            );

            if filters
                .max_results
                .is_some_and(|max| report.accepted() >= u64::from(max))
            {
                break StopReason::MaxResults;
            }

            match page.next_page_token {
                Some(next) if !seen_tokens.insert(next.clone()) => {
                    report.last_error = Some(format!("page token '{}' repeated", next));
                    break StopReason::RepeatedPageToken;
                }
                Some(next) => page_token = Some(next),
                None => break StopReason::Exhausted,
            }
        };

        report.stop_reason = stop_reason;

        if report.is_partial() {
            tracing::warn!(
                stop_reason = ?report.stop_reason,
                pages = report.pages_fetched,
                new = report.new,
                known = report.known,
                error = ?report.last_error,
                "Discovery stopped early; partial results kept"
            );
        } else {
            tracing::info!(
                stop_reason = ?report.stop_reason,
                pages = report.pages_fetched,
                new = report.new,
                known = report.known,
                updated = report.updated,
                invalid = report.invalid,
                date_flagged = report.date_flagged,
                "Discovery complete"
            );
        }

        Ok(report)
    }

    /// Fetch one page, taking a rate-limit token before every attempt
    async fn fetch_with_retry(
        &self,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> PageFetch {
        let mut last_error = String::new();

        for attempt in 1..=self.page_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return PageFetch::Cancelled,
                _ = self.limiter.acquire() => {}
            }

            match self.portal.fetch_page(page_token).await {
                Ok(page) => return PageFetch::Fetched(page),
                Err(e) => {
                    tracing::warn!(
                        page_token = ?page_token,
                        attempt,
                        max_attempts = self.page_attempts,
                        error = %e,
                        "Listing page fetch failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.page_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return PageFetch::Cancelled,
                    _ = tokio::time::sleep(self.page_retry_delay) => {}
                }
            }
        }

        PageFetch::Failed(last_error)
    }
}
