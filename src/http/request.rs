//! Per-request setup ahead of admission.
//!
//! # Responsibilities
//! - Assign a request ID (UUID v4) unless the client sent one
//! - Attach a [`RequestContext`] whose token is a child of the server's
//!   shutdown token and whose deadline is the configured request timeout
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - The ID is echoed on the response, including throttle rejections

use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::throttle::RequestContext;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Identifier of a single request, stored in the request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access to the [`RequestId`] set by [`request_id_middleware`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&RequestId>;
}

impl<B> RequestIdExt for axum::http::Request<B> {
    fn request_id(&self) -> Option<&RequestId> {
        self.extensions().get::<RequestId>()
    }
}

pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| RequestId(v.to_string()))
        .unwrap_or_default();

    let header = HeaderValue::from_str(id.as_str()).ok();
    if let Some(value) = header.clone() {
        req.headers_mut().insert(X_REQUEST_ID, value);
    }
    req.extensions_mut().insert(id);

    let mut response = next.run(req).await;
    if let Some(value) = header {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// Source of per-request contexts.
#[derive(Debug, Clone)]
pub struct ContextSource {
    shutdown: CancellationToken,
    request_timeout: Duration,
}

impl ContextSource {
    pub fn new(shutdown: CancellationToken, request_timeout: Duration) -> Self {
        Self {
            shutdown,
            request_timeout,
        }
    }

    pub fn make(&self) -> RequestContext {
        RequestContext::new(self.shutdown.child_token())
            .with_deadline(Instant::now() + self.request_timeout)
    }
}

pub async fn request_context_middleware(
    State(source): State<ContextSource>,
    mut req: Request,
    next: Next,
) -> Response {
    if req.extensions().get::<RequestContext>().is_none() {
        req.extensions_mut().insert(source.make());
    }
    next.run(req).await
}
