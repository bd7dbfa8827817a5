use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::identity::CallerContext;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Propagates the caller's `X-Request-Id` or assigns a fresh one.
///
/// The value is stored in request extensions for the trace span and echoed on
/// the response, including streamed export bodies.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    let id = req
        .headers()
        .get(&header)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("unknown"));

    req.extensions_mut().insert(id.clone());
    let mut res = next.run(req).await;
    res.headers_mut().insert(header, id);
    res
}

/// Stores the gateway-provided caller identity in request extensions.
///
/// Requests without identity pass through; handlers that need a caller
/// reject them through the `Caller` extractor.
pub async fn caller_identity(mut req: Request<Body>, next: Next) -> Response {
    if let Some(ctx) = CallerContext::from_headers(req.headers()) {
        tracing::debug!(user = %ctx.user, path = %req.uri().path(), "Caller identified");
        req.extensions_mut().insert(ctx);
    }
    next.run(req).await
}
