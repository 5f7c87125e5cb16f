//! Shared HTTP plumbing for the portal, importer and webhook clients

use reqwest::StatusCode;
use std::time::Duration;

const USER_AGENT: &str = concat!("harvest-backfill/", env!("CARGO_PKG_VERSION"));

/// Whether a failed call is worth repeating as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

/// 429 and 5xx are transient; every other non-success status is permanent
pub fn classify_status(status: StatusCode) -> FailureClass {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

/// Timeouts and connection problems are transient; undecodable bodies and
/// malformed requests are permanent
pub fn classify_request_error(err: &reqwest::Error) -> FailureClass {
    if err.is_decode() || err.is_builder() || err.is_redirect() {
        return FailureClass::Permanent;
    }
    if let Some(status) = err.status() {
        return classify_status(status);
    }
    FailureClass::Transient
}

/// `reqwest::Client` with the crate user agent and a request timeout
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Join a configured base URL and a path without doubling slashes
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), FailureClass::Transient);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), FailureClass::Permanent);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), FailureClass::Permanent);
        assert_eq!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), FailureClass::Permanent);
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("http://h/api/", "/imports"), "http://h/api/imports");
        assert_eq!(endpoint("http://h", "sessions"), "http://h/sessions");
    }
}
