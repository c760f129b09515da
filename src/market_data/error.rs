use thiserror::Error;

/// Why a source could not produce a price for an identifier.
///
/// The resolver treats every variant the same way (try the next source); the
/// distinction only matters for logging.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid price: {0}")]
    InvalidPrice(String),

    #[error("identifier {0:?} not available from this source")]
    Unsupported(String),

    #[error("source panicked: {0}")]
    Panicked(String),
}

impl SourceError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SourceError::RateLimited { .. })
    }

    /// Short label for structured log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceError::Network(_) => "network",
            SourceError::Timeout => "timeout",
            SourceError::Status { .. } => "status",
            SourceError::RateLimited { .. } => "rate_limited",
            SourceError::Malformed(_) => "malformed",
            SourceError::InvalidPrice(_) => "invalid_price",
            SourceError::Unsupported(_) => "unsupported",
            SourceError::Panicked(_) => "panicked",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout
        } else if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else {
            SourceError::Network(err.to_string())
        }
    }
}

/// Errors the cache surfaces to callers. Upstream failures never show up here.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("snapshot persistence is required but the write failed: {0:#}")]
    PersistenceRequired(anyhow::Error),

    #[error("refresh task aborted: {0}")]
    RefreshAborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_labels() {
        assert_eq!(SourceError::Timeout.kind(), "timeout");
        assert_eq!(SourceError::RateLimited { attempts: 3 }.kind(), "rate_limited");
        assert!(SourceError::RateLimited { attempts: 3 }.is_rate_limit());
        assert!(!SourceError::Network("reset".into()).is_rate_limit());
    }

    #[test]
    fn status_error_message_includes_body() {
        let err = SourceError::Status {
            status: 503,
            body: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: maintenance");
    }
}
