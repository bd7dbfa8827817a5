//! Error types returned by fact stores and search backends.

use std::fmt;

/// Errors that can occur while talking to a storage or search backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend rejected the query as malformed.
    #[error("Invalid query: {message}")]
    InvalidQuery {
        /// Description of why the query is invalid.
        message: String,
    },

    /// The target index does not exist.
    #[error("Index not found: {index}")]
    IndexNotFound {
        /// Name of the missing index.
        index: String,
    },

    /// Failed to reach the backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// Any other backend failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `InvalidQuery` error.
    #[must_use]
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }

    /// Creates a new `IndexNotFound` error.
    #[must_use]
    pub fn index_not_found(index: impl Into<String>) -> Self {
        Self::IndexNotFound {
            index: index.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the error category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidQuery { .. } | Self::IndexNotFound { .. } => ErrorCategory::Query,
            Self::ConnectionError { .. } => ErrorCategory::Transient,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Coarse classification of storage errors, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The query itself is wrong.
    Query,
    /// The backend is temporarily unavailable.
    Transient,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Transient => write!(f, "transient"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            StorageError::invalid_query("bad").category(),
            ErrorCategory::Query
        );
        assert_eq!(
            StorageError::index_not_found("events").category(),
            ErrorCategory::Query
        );
        assert!(StorageError::connection_error("refused").is_transient());
        assert!(!StorageError::internal("boom").is_transient());
    }

    #[test]
    fn test_display() {
        let err = StorageError::index_not_found("events-*");
        assert_eq!(err.to_string(), "Index not found: events-*");
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }
}
