use std::time;

use thiserror::Error;

/// Enumeration of errors related to relaying events to webhook targets.
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("error parsing webhook url {url}: {error}")]
    ParseUrlError { url: String, error: url::ParseError },
    #[error("webhook secret for {url} is not a valid header value")]
    ParseSecretError { url: String },
    #[error("failed to construct webhook http client: {0}")]
    ClientError(reqwest::Error),
    #[error("a webhook could not be delivered but it could be retried later: {error}")]
    RetryableRequestError {
        error: reqwest::Error,
        retry_after: Option<time::Duration>,
    },
}

impl WebhookError {
    /// How long the target asked us to wait, if it did.
    pub fn retry_after(&self) -> Option<time::Duration> {
        match self {
            WebhookError::RetryableRequestError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
