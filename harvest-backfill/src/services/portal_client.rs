//! Portal listing client
//!
//! The portal has no bulk API: sessions are enumerated one listing page at a
//! time. Each page fetch costs one rate-limit token, taken by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::http::{build_client, classify_request_error, classify_status, endpoint, FailureClass};

/// One listing row before normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDescriptor {
    /// Bare report id or a link carrying it
    #[serde(alias = "report_id", alias = "url")]
    pub raw_id_or_url: String,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub display_text: Option<String>,

    /// Date header of the listing section this row sits under
    #[serde(default)]
    pub date_context_text: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// One listing page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortalPage {
    #[serde(default, alias = "sessions")]
    pub descriptors: Vec<RawDescriptor>,

    /// `None` on the last page
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortalError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl PortalError {
    fn classified(class: FailureClass, message: String) -> Self {
        match class {
            FailureClass::Transient => PortalError::Transient(message),
            FailureClass::Permanent => PortalError::Permanent(message),
        }
    }
}

/// Source of listing pages
#[async_trait]
pub trait PortalClient: Send + Sync {
    /// Fetch the page identified by `page_token` (`None` for the first page)
    async fn fetch_page(&self, page_token: Option<&str>) -> Result<PortalPage, PortalError>;
}

/// JSON listing endpoint: `GET {base_url}/sessions?page_token=...`
pub struct HttpPortalClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpPortalClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PortalError> {
        let http_client =
            build_client(timeout).map_err(|e| PortalError::Permanent(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl PortalClient for HttpPortalClient {
    async fn fetch_page(&self, page_token: Option<&str>) -> Result<PortalPage, PortalError> {
        let url = endpoint(&self.base_url, "sessions");
        let mut request = self.http_client.get(&url);
        if let Some(token) = page_token {
            request = request.query(&[("page_token", token)]);
        }

        tracing::debug!(url = %url, page_token = ?page_token, "Fetching portal listing page");

        let response = request.send().await.map_err(|e| {
            PortalError::classified(classify_request_error(&e), format!("GET {}: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortalError::classified(
                classify_status(status),
                format!("GET {} returned {}: {}", url, status, body.trim()),
            ));
        }

        response
            .json::<PortalPage>()
            .await
            .map_err(|e| PortalError::Permanent(format!("undecodable listing page: {}", e)))
    }
}
