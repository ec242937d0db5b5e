//! Error types for the Windowgate rate limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Windowgate operations.
#[derive(Error, Debug)]
pub enum WindowgateError {
    /// Invalid or missing configuration. Raised before any network I/O.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store session could not be established, was lost, or was closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A single counter store call failed.
    #[error("Store error: {0}")]
    Store(String),

    /// No resource id could be derived for the request.
    #[error("Missing resource key: {0}")]
    MissingKey(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WindowgateError {
    /// Whether this error means the store session is unusable.
    pub fn is_connection(&self) -> bool {
        matches!(self, WindowgateError::Connection(_))
    }
}

impl From<StoreError> for WindowgateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(_) | StoreError::Closed => {
                WindowgateError::Connection(err.to_string())
            }
            StoreError::Command(_) => WindowgateError::Store(err.to_string()),
        }
    }
}

/// Result type alias for Windowgate operations.
pub type Result<T> = std::result::Result<T, WindowgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let err: WindowgateError = StoreError::Closed.into();
        assert!(err.is_connection());

        let err: WindowgateError = StoreError::Connection("refused".into()).into();
        assert!(err.is_connection());

        let err: WindowgateError = StoreError::Command("timeout".into()).into();
        assert!(matches!(err, WindowgateError::Store(_)));
        assert!(!err.is_connection());
    }
}
