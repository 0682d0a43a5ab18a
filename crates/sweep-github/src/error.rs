//! Error types for the GitHub client.

use thiserror::Error;

/// Errors that can occur when talking to the GitHub API.
#[derive(Debug, Error)]
pub enum GithubError {
    /// The installation token exchange did not return 201.
    #[error("installation token exchange failed ({status}): {message}")]
    AuthExchangeFailed { status: u16, message: String },

    /// Rate limited, and the retry budget is spent.
    #[error("rate limited{}", match (endpoint, retry_after_secs) {
        (Some(ep), Some(secs)) => format!(" on {} (retry after {}s)", ep, secs),
        (Some(ep), None) => format!(" on {}", ep),
        (None, Some(secs)) => format!(" (retry after {}s)", secs),
        (None, None) => String::new(),
    })]
    RateLimited {
        /// The endpoint that was rate limited (optional).
        endpoint: Option<String>,
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// Server-side failure (5xx) that persisted through retries.
    #[error("GitHub unavailable ({status}) on {endpoint}")]
    Unavailable { status: u16, endpoint: String },

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The app private key could not be used to sign a JWT.
    #[error("invalid app key: {0}")]
    InvalidKey(String),

    /// The configured API base URL is unusable.
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(String),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GithubError {
    /// Whether the failure is a throttling or availability problem rather
    /// than a hard auth or not-found answer.
    pub fn is_transient(&self) -> bool {
        match self {
            GithubError::RateLimited { .. } | GithubError::Unavailable { .. } => true,
            GithubError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message() {
        let err = GithubError::RateLimited {
            endpoint: Some("installation/repositories".into()),
            retry_after_secs: Some(30),
        };
        assert_eq!(
            err.to_string(),
            "rate limited on installation/repositories (retry after 30s)"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            GithubError::Unavailable {
                status: 502,
                endpoint: "x".into()
            }
            .is_transient()
        );
        assert!(
            !GithubError::AuthExchangeFailed {
                status: 401,
                message: "bad credentials".into()
            }
            .is_transient()
        );
        assert!(!GithubError::NotFound("repo".into()).is_transient());
    }
}
