use thiserror::Error;

/// Application-wide error types for Gleaner.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a listing or detail page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Classifier API call failed.
    #[error("Classifier error (HTTP {status_code}): {message}")]
    ClassifierError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// A store scraper failed to produce a listing.
    ///
    /// Scraper failures are retryable unless the scraper explicitly says otherwise.
    #[error("Scrape error: {message}")]
    ScrapeError { message: String, retryable: bool },

    /// A pooled resource (e.g. a headless browser) could not be created.
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// The resource pool has been shut down.
    #[error("Resource pool is closed")]
    PoolClosed,

    /// Checkpoint file could not be written.
    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The run was interrupted by a shutdown signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// A retried operation gave up.
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<AppError>,
    },

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::ClassifierError { retryable, .. } => *retryable,
            AppError::ScrapeError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if nothing is gained by running the same operation again.
    ///
    /// Whole harvest jobs are retried on any error that is not fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::ConfigError(_) | AppError::Cancelled | AppError::PoolClosed => true,
            AppError::ScrapeError { retryable, .. } => !*retryable,
            AppError::ClassifierError {
                status_code,
                retryable,
                ..
            } => !*retryable && matches!(status_code, 401 | 403),
            AppError::RetriesExhausted { last_error, .. } => last_error.is_fatal(),
            _ => false,
        }
    }

    /// Returns true if this error signals a rate limit and should escalate backoff.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            AppError::RateLimitExceeded => true,
            AppError::ClassifierError { status_code, .. } => *status_code == 429,
            AppError::RetriesExhausted { last_error, .. } => last_error.is_rate_limit(),
            _ => false,
        }
    }

    /// Returns true if the collaborator behind this error could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => msg.contains("connect") || msg.contains("timeout"),
            AppError::RetriesExhausted { last_error, .. } => last_error.is_unreachable(),
            _ => false,
        }
    }

    /// Number of attempts recorded on a terminal failure (1 for any other error).
    pub fn attempts(&self) -> u32 {
        match self {
            AppError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The innermost error message, without retry annotations.
    pub fn root_message(&self) -> String {
        match self {
            AppError::RetriesExhausted { last_error, .. } => last_error.root_message(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30_000).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::ClassifierError {
                message: "server error".into(),
                status_code: 500,
                retryable: true,
            }
            .is_retryable()
        );
        assert!(
            AppError::ScrapeError {
                message: "selector missing".into(),
                retryable: true,
            }
            .is_retryable()
        );
        assert!(!AppError::ConfigError("bad".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(AppError::ConfigError("missing".into()).is_fatal());
        assert!(
            AppError::ScrapeError {
                message: "blocked".into(),
                retryable: false,
            }
            .is_fatal()
        );
        assert!(
            AppError::ClassifierError {
                message: "bad key".into(),
                status_code: 401,
                retryable: false,
            }
            .is_fatal()
        );
        assert!(!AppError::Generic("anything".into()).is_fatal());
        assert!(!AppError::HttpError("HTTP 500".into()).is_fatal());
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(AppError::RateLimitExceeded.is_rate_limit());
        assert!(
            AppError::ClassifierError {
                message: "slow down".into(),
                status_code: 429,
                retryable: true,
            }
            .is_rate_limit()
        );
        assert!(!AppError::Timeout(10).is_rate_limit());
    }

    #[test]
    fn test_exhausted_error_reports_attempts_and_root() {
        let err = AppError::RetriesExhausted {
            operation: "scrape".into(),
            attempts: 3,
            last_error: Box::new(AppError::NetworkError("reset".into())),
        };
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.root_message(), "Network error: reset");
        assert!(err.is_unreachable());
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert_eq!(AppError::Generic("x".into()).attempts(), 1);
    }
}
