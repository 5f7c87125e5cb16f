//! Session importer collaborator
//!
//! Fetches and persists the full record set of one session. Every failure is
//! typed: the orchestrator records the `Display` form (prefixed with the
//! failure class) as the descriptor's `last_error`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::http::{build_client, classify_request_error, classify_status, endpoint, FailureClass};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImportError {
    /// Timeout, rate-limit rejection, temporary server error
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed record, rejected access key
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ImportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ImportError::Transient(_))
    }

    fn classified(class: FailureClass, message: String) -> Self {
        match class {
            FailureClass::Transient => ImportError::Transient(message),
            FailureClass::Permanent => ImportError::Permanent(message),
        }
    }
}

#[async_trait]
pub trait Importer: Send + Sync {
    /// Import one session; returns the number of records stored
    async fn import_session(&self, report_id: &str, access_key: &str) -> Result<u64, ImportError>;
}

#[derive(Debug, Serialize)]
struct ImportRequest<'a> {
    report_id: &'a str,
    access_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImportResponse {
    record_count: u64,
}

/// JSON import endpoint: `POST {base_url}/imports`
pub struct HttpImporter {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpImporter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ImportError> {
        let http_client =
            build_client(timeout).map_err(|e| ImportError::Permanent(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl Importer for HttpImporter {
    async fn import_session(&self, report_id: &str, access_key: &str) -> Result<u64, ImportError> {
        let url = endpoint(&self.base_url, "imports");
        tracing::debug!(report_id = %report_id, url = %url, "Requesting session import");

        let response = self
            .http_client
            .post(&url)
            .json(&ImportRequest {
                report_id,
                access_key,
            })
            .send()
            .await
            .map_err(|e| ImportError::classified(classify_request_error(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::classified(
                classify_status(status),
                format!("importer returned {}: {}", status, body.trim()),
            ));
        }

        let body: ImportResponse = response
            .json()
            .await
            .map_err(|e| ImportError::Permanent(format!("undecodable import response: {}", e)))?;

        Ok(body.record_count)
    }
}
