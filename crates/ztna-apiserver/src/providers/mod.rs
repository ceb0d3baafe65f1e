//! Clients for the external access and health collaborators.
//!
//! JITA answers "who is just-in-time granted on this gateway"; Kolide
//! answers "which devices currently fail health checks". Both are plain
//! REST APIs polled by the background jobs.

pub mod jita;
pub mod kolide;

use std::time::Duration;

pub use jita::{JitaCache, JitaClient, PrivilegedAccess};
pub use kolide::{HealthSource, KolideClient, ProviderDevice};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider misconfigured: {0}")]
    Config(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    /// No successful fetch yet for this key.
    #[error("Nothing cached for {0}")]
    NotCached(String),
}

/// Shared client setup for provider APIs.
fn http_client() -> Result<reqwest::Client, ProviderError> {
    // reqwest is built with rustls-no-provider; Err means already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Config(format!("HTTP client: {e}")))
}

/// Turn a non-2xx response into [`ProviderError::Api`], keeping the body for logs.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::Api {
        status: status.as_u16(),
        body,
    })
}
