use thiserror::Error;

/// Core error types for rulestream domain validation
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Separator and list separator must differ (both are '{0}')")]
    SeparatorConflict(char),

    #[error("Invalid CSV separator '{0}': must be a single printable ASCII character")]
    InvalidSeparator(char),

    #[error("Export title must not be empty")]
    EmptyTitle,

    #[error("At least one fact id is required")]
    EmptyFactList,

    #[error("At least one search request is required")]
    EmptySearchRequests,

    #[error("Search indices must not be empty")]
    EmptyIndices,
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
