//! HTTP client setup shared by the collector and the webhook publisher.

use std::time::Duration;

use ravedigest_shared::{DigestError, Result};
use reqwest::{Client, StatusCode};

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

/// User-Agent string for outgoing requests.
const USER_AGENT: &str = concat!("RaveDigest/", env!("CARGO_PKG_VERSION"));

/// Build a reqwest client with the given per-request timeout.
pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| DigestError::Network(format!("failed to build HTTP client: {e}")))
}

/// Map a response status to an error. Server errors, timeouts and rate
/// limits are transient; other client errors are permanent.
pub fn classify_status(url: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(DigestError::Network(format!("{url}: HTTP {status}")))
    } else {
        Err(DigestError::validation(format!("{url}: HTTP {status}")))
    }
}
