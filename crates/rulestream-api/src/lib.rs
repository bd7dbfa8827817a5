use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub status: u16,
    /// Stable machine-readable code, e.g. `export.separator_conflict`
    pub code: String,
    pub message: String,
}

/// High-level API errors to be mapped to HTTP responses
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {message}")]
    BadRequest { code: &'static str, message: String },
    #[error("Unauthorized: {message}")]
    Unauthorized { code: &'static str, message: String },
    #[error("Forbidden: {message}")]
    Forbidden { code: &'static str, message: String },
    #[error("Not found: {message}")]
    NotFound { code: &'static str, message: String },
    #[error("Conflict: {message}")]
    Conflict { code: &'static str, message: String },
    #[error("Too many requests: {message}")]
    TooManyRequests { code: &'static str, message: String },
    #[error("Internal server error: {message}")]
    Internal { code: &'static str, message: String },
}

impl ApiError {
    pub fn bad_request(code: &'static str, msg: impl Into<String>) -> Self {
        Self::BadRequest {
            code,
            message: msg.into(),
        }
    }
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            code: "auth.unauthenticated",
            message: msg.into(),
        }
    }
    /// Permission failures never carry details beyond this message.
    pub fn missing_permission() -> Self {
        Self::Forbidden {
            code: "auth.missing_permission",
            message: "missing permission".to_string(),
        }
    }
    pub fn forbidden(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Forbidden {
            code,
            message: msg.into(),
        }
    }
    pub fn not_found(code: &'static str, msg: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: msg.into(),
        }
    }
    pub fn conflict(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Conflict {
            code,
            message: msg.into(),
        }
    }
    pub fn too_many_requests(code: &'static str, msg: impl Into<String>) -> Self {
        Self::TooManyRequests {
            code,
            message: msg.into(),
        }
    }
    pub fn internal(code: &'static str, msg: impl Into<String>) -> Self {
        Self::Internal {
            code,
            message: msg.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden { .. } => StatusCode::FORBIDDEN,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest { code, .. }
            | ApiError::Unauthorized { code, .. }
            | ApiError::Forbidden { code, .. }
            | ApiError::NotFound { code, .. }
            | ApiError::Conflict { code, .. }
            | ApiError::TooManyRequests { code, .. }
            | ApiError::Internal { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest { message, .. }
            | ApiError::Unauthorized { message, .. }
            | ApiError::Forbidden { message, .. }
            | ApiError::NotFound { message, .. }
            | ApiError::Conflict { message, .. }
            | ApiError::TooManyRequests { message, .. }
            | ApiError::Internal { message, .. } => message,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            status: self.status_code().as_u16(),
            code: self.code().to_string(),
            message: self.message().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::to_vec(&self.to_error_response()).unwrap_or_else(|_| {
            // Fallback minimal body if serialization fails
            br#"{"status":500,"code":"internal","message":"serialization failure"}"#.to_vec()
        });

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
