//! Error types for upstream provider calls.

use thiserror::Error;

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur when talking to an upstream BigModel endpoint.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP request failed before a response was received.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success HTTP status.
    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Failed to serialize a request body.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The request is not acceptable for this provider.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Reading the response body failed mid-stream.
    #[error("Stream read error: {0}")]
    Stream(String),

    /// Transport configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Check if this error is worth another attempt against a different endpoint.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e.is_connect() || e.is_timeout(),
            ProviderError::Status { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Stream(_) => true,
            _ => false,
        }
    }

    /// Check if the request itself was rejected.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, ProviderError::InvalidRequest(_))
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryable() {
        let err = ProviderError::Status {
            status: 503,
            body: "busy".to_string(),
        };
        assert!(err.is_retryable());

        let err = ProviderError::Status {
            status: 400,
            body: "bad".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_request_not_retryable() {
        let err = ProviderError::InvalidRequest("style is required".to_string());
        assert!(err.is_invalid_request());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ProviderError::Status {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream returned status 502: bad gateway");
    }
}
