//! Tower middleware wrapping any HTTP service in an [`AdmissionController`].

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service};

use crate::config::ThrottleConfig;
use crate::throttle::context::RequestContext;
use crate::throttle::controller::AdmissionController;
use crate::throttle::error::{CancelStage, Rejection};

/// Pause applied before a rejection response is written.
///
/// Tells the client to back off; the permits are already released by the
/// time the pause starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectionBackoff {
    /// Delay for capacity, timeout and in-backlog cancellation rejections.
    pub rejected: Duration,
    /// Delay when the context was already done on arrival.
    pub early_cancel: Duration,
}

impl Default for RejectionBackoff {
    fn default() -> Self {
        Self {
            rejected: Duration::from_secs(3),
            early_cancel: Duration::from_secs(5),
        }
    }
}

impl RejectionBackoff {
    /// No pause at all.
    pub fn none() -> Self {
        Self {
            rejected: Duration::ZERO,
            early_cancel: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            rejected: Duration::from_millis(config.rejection_backoff_ms),
            early_cancel: Duration::from_millis(config.early_cancel_backoff_ms),
        }
    }

    pub fn delay_for(&self, rejection: &Rejection) -> Duration {
        match rejection {
            Rejection::ContextCanceled {
                stage: CancelStage::BeforeBacklog,
            } => self.early_cancel,
            _ => self.rejected,
        }
    }
}

impl AdmissionController {
    /// Wrap `inner` so every request goes through admission first.
    pub fn wrap<S>(self: &Arc<Self>, inner: S) -> Throttle<S> {
        Throttle {
            inner,
            controller: Arc::clone(self),
        }
    }
}

/// Layer producing [`Throttle`] services that share one controller.
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    controller: Arc<AdmissionController>,
}

impl ThrottleLayer {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = Throttle<S>;

    fn layer(&self, inner: S) -> Self::Service {
        self.controller.wrap(inner)
    }
}

/// Service enforcing admission before delegating to `inner`.
#[derive(Debug, Clone)]
pub struct Throttle<S> {
    inner: S,
    controller: Arc<AdmissionController>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for Throttle<S>
where
    S: Service<Request<ReqBody>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness, leave a fresh clone.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let controller = Arc::clone(&self.controller);
        let ctx = req
            .extensions()
            .get::<RequestContext>()
            .cloned()
            .unwrap_or_default();

        Box::pin(async move {
            match controller.admit(&ctx, move || inner.call(req)).await {
                Ok(result) => result,
                Err(rejection) => {
                    let delay = controller.backoff().delay_for(&rejection);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(rejection.into_response())
                }
            }
        })
    }
}
