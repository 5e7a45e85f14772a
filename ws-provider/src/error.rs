use reqwest::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Operation {id} failed: {message}")]
    OperationFailed { id: String, message: String },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device {0} has no mesh address")]
    NoAddress(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

/// Turn non-success responses into [`ProviderError::Api`].
pub(crate) async fn check(response: Response) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Api { status, message })
}

/// Like [`check`], but a 404 becomes [`ProviderError::NotFound`] naming `what`.
pub(crate) async fn check_found(response: Response, what: impl Into<String>) -> Result<Response> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(what.into()));
    }
    check(response).await
}
