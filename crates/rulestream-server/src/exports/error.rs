use rulestream_api::ApiError;
use rulestream_core::{CoreError, FactId};
use rulestream_storage::StorageError;
use thiserror::Error;

use super::job::ExportStatus;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Unknown facts: {}", join_ids(.0))]
    UnknownFacts(Vec<FactId>),

    #[error("No fact found for the requested ids")]
    NoFactFound,

    #[error("Too many search requests: {count} (maximum {max})")]
    TooManySearchRequests { count: usize, max: usize },

    #[error("Search backend '{0}' is not configured")]
    UnknownBackend(String),

    #[error("Export is disabled on search backend '{0}'")]
    ExportDisabled(String),

    #[error("Export not found")]
    NotFound,

    #[error("Search backend error: {0}")]
    Backend(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Browser disconnected")]
    BrowserDisconnected,

    #[error("Export canceled")]
    Canceled,

    #[error("Invalid export status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: ExportStatus,
        to: ExportStatus,
    },

    #[error("Export task failed: {0}")]
    Task(String),
}

fn join_ids(ids: &[FactId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ExportError {
    /// Stable machine-readable code returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(err) => match err {
                CoreError::SeparatorConflict(_) => "export.separator_conflict",
                CoreError::InvalidSeparator(_) => "export.invalid_separator",
                CoreError::EmptyTitle => "export.empty_title",
                CoreError::EmptyFactList => "export.empty_fact_list",
                CoreError::EmptySearchRequests => "export.empty_search_requests",
                CoreError::EmptyIndices => "export.empty_indices",
            },
            Self::UnknownFacts(_) => "export.unknown_facts",
            Self::NoFactFound => "export.no_fact_found",
            Self::TooManySearchRequests { .. } => "export.too_many_search_requests",
            Self::UnknownBackend(_) => "export.unknown_backend",
            Self::ExportDisabled(_) => "export.disabled",
            Self::NotFound => "export.not_found",
            Self::Backend(_) => "export.backend_error",
            Self::Io(_) => "export.io_error",
            Self::Csv(_) => "export.csv_error",
            Self::BrowserDisconnected => "export.browser_disconnected",
            Self::Canceled => "export.canceled",
            Self::InvalidStatusTransition { .. } => "export.invalid_status_transition",
            Self::Task(_) => "export.task_failed",
        }
    }

    /// Client-caused errors that must be rejected before any work starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::UnknownFacts(_)
                | Self::TooManySearchRequests { .. }
                | Self::UnknownBackend(_)
        )
    }

    /// Maps the error to the HTTP surface. `verbose` exposes internal details
    /// in 500 responses.
    pub fn into_api_error(self, verbose: bool) -> ApiError {
        let code = self.code();
        let message = self.to_string();
        if self.is_validation() {
            return ApiError::bad_request(code, message);
        }
        match self {
            Self::ExportDisabled(_) => ApiError::forbidden(code, message),
            Self::NotFound => ApiError::not_found(code, message),
            _ => {
                tracing::error!(error = %message, code, "Export request failed");
                if verbose {
                    ApiError::internal(code, message)
                } else {
                    ApiError::internal(code, "internal export error")
                }
            }
        }
    }
}

impl From<ExportError> for ApiError {
    fn from(err: ExportError) -> Self {
        err.into_api_error(false)
    }
}
