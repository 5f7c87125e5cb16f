//! Terminal run event sinks
//!
//! Delivery is best effort: the orchestrator logs a failed notification and
//! carries on, the run outcome is already persisted by then.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use super::http::build_client;
use crate::models::BackfillRun;

/// Counters reported with every run event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub sessions_total: i64,
    pub sessions_processed: i64,
    pub sessions_imported: i64,
    pub sessions_failed: i64,
    pub last_processed_report_id: Option<String>,
}

impl From<&BackfillRun> for RunSummary {
    fn from(run: &BackfillRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            sessions_total: run.sessions_total,
            sessions_processed: run.sessions_processed,
            sessions_imported: run.sessions_imported,
            sessions_failed: run.sessions_failed,
            last_processed_report_id: run.last_processed_report_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Completed { summary: RunSummary },
    Failed { summary: RunSummary, error: String },
    Paused { summary: RunSummary },
}

impl RunEvent {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunEvent::Completed { summary }
            | RunEvent::Failed { summary, .. }
            | RunEvent::Paused { summary } => summary,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::Completed { .. } => "completed",
            RunEvent::Failed { .. } => "failed",
            RunEvent::Paused { .. } => "paused",
        }
    }
}

#[derive(Debug, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &RunEvent) -> Result<(), NotifyError>;
}

/// Writes run events to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<(), NotifyError> {
        let summary = event.summary();
        match event {
            RunEvent::Failed { error, .. } => tracing::error!(
                run_id = %summary.run_id,
                processed = summary.sessions_processed,
                imported = summary.sessions_imported,
                failed = summary.sessions_failed,
                error = %error,
                "Backfill run failed"
            ),
            _ => tracing::info!(
                run_id = %summary.run_id,
                event = event.name(),
                total = summary.sessions_total,
                processed = summary.sessions_processed,
                imported = summary.sessions_imported,
                failed = summary.sessions_failed,
                "Backfill run {}",
                event.name()
            ),
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a configured URL
pub struct WebhookNotifier {
    http_client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let http_client = build_client(timeout).map_err(|e| NotifyError(e.to_string()))?;
        Ok(Self {
            http_client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &RunEvent) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
