//! Caller identity forwarded by the upstream gateway.
//!
//! Authentication happens before requests reach this server. The gateway
//! passes the authenticated user in trusted headers:
//!
//! - `X-User-Id` (required)
//! - `X-User-Login`
//! - `X-User-Permissions`, comma separated
//!
//! [`crate::middleware::caller_identity`] turns them into a [`CallerContext`]
//! stored in request extensions, and handlers take the [`Caller`] extractor.

use std::collections::HashSet;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use rulestream_api::ApiError;
use rulestream_core::UserRef;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_LOGIN_HEADER: &str = "x-user-login";
pub const USER_PERMISSIONS_HEADER: &str = "x-user-permissions";

/// Permission names checked by the export handlers.
pub mod permissions {
    pub const EXPORT_READ: &str = "export.read";
    pub const EXPORT_CREATE: &str = "export.create";
    pub const EXPORT_DELETE: &str = "export.delete";
    pub const EXPORT_STREAM: &str = "export.stream";
    /// Grants every permission
    pub const ALL: &str = "*";
}

#[derive(Debug, Clone)]
pub struct CallerContext {
    pub user: UserRef,
    pub permissions: HashSet<String>,
}

impl CallerContext {
    pub fn new(user: UserRef, permissions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            user,
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the context from gateway headers; `None` without a user id.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let mut user = UserRef::new(header(USER_ID_HEADER)?);
        if let Some(login) = header(USER_LOGIN_HEADER) {
            user = user.with_login(login);
        }
        let permissions = header(USER_PERMISSIONS_HEADER)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Some(Self { user, permissions })
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission) || self.permissions.contains(permissions::ALL)
    }

    pub fn require(&self, permission: &str) -> Result<(), ApiError> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            tracing::debug!(user = %self.user, permission, "Permission denied");
            Err(ApiError::missing_permission())
        }
    }
}

/// Extractor for the authenticated caller.
///
/// Rejects with 401 when the identity middleware found no user.
#[derive(Debug, Clone)]
pub struct Caller(pub CallerContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerContext>()
            .cloned()
            .map(Caller)
            .ok_or_else(|| ApiError::unauthorized("Missing caller identity"))
    }
}
