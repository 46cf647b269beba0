//! HTTP client factory with consistent timeout configuration.
//!
//! Provider clients and the push gateway notifier are built through
//! `build_client()` rather than constructing `reqwest::Client` directly.

use reqwest::Client;
use std::time::Duration;

use crate::app_error::AppError;

/// Connect timeout (TCP handshake + TLS).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-attempt request timeout. Provider calls retry on top of this, so it is
/// kept well under the sync deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an HTTP client with default timeouts.
pub fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(DEFAULT_REQUEST_TIMEOUT)
        .build()
}

/// Classify a transport failure. Anything that never produced a response is
/// treated as the provider being unreachable.
pub fn map_transport_error(provider: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        AppError::ProviderUnavailable(format!("{provider} request failed: {error}"))
    } else {
        AppError::Internal(format!("{provider} request failed: {error}"))
    }
}
