//! Domain error kinds
//!
//! `anyhow` is used at the application edges for context-rich error chains;
//! internal call sites that need to match on error *kind* (rather than just
//! propagate and print) return this enum instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("failed to parse line: {0}")]
    Parse(String),

    #[error("pricing unavailable for model {0:?}")]
    PricingUnavailable(Option<String>),

    #[error("cannot refresh pricing while offline")]
    OfflineRefreshDenied,

    #[error("ingest failed after exhausting retries: {0}")]
    IngestFailed(String),

    #[error("cache entry corrupted: {0}")]
    CacheCorruption(String),

    #[error("aggregation store error: {0}")]
    Store(String),

    #[error("refresh cancelled between pipeline phases")]
    CancelledRefresh,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UsageError::Parse("unexpected eof".into());
        assert_eq!(err.to_string(), "failed to parse line: unexpected eof");
    }

    #[test]
    fn test_pricing_unavailable_display() {
        let err = UsageError::PricingUnavailable(Some("claude-9".to_string()));
        assert!(err.to_string().contains("claude-9"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: UsageError = io_err.into();
        assert!(err.to_string().contains("io error"));
    }

    #[test]
    fn test_cancelled_refresh_display() {
        let err = UsageError::CancelledRefresh;
        assert!(err.to_string().contains("cancelled"));
    }
}
