//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Wrap the application router in the throttle and its supporting layers
//! - Bind server to listener
//! - Spawn the admin API when enabled
//! - Graceful shutdown: cancel waiting requests, drain, exit
//!
//! # Layer order (outermost first)
//! ```text
//! request ID → TraceLayer → metrics → request context → throttle → handler timeout → app
//! ```
//!
//! The request ID is assigned before the trace span opens, so every event
//! logged while serving the request carries it.

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin::{setup_admin_router, AdminState};
use crate::config::ServerConfig;
use crate::http::request::{
    request_context_middleware, request_id_middleware, ContextSource, RequestId, RequestIdExt,
};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::throttle::{AdmissionController, ThrottleError, ThrottleLayer};

/// HTTP server fronting an application router with admission control.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
    controller: Arc<AdmissionController>,
    /// Parent of every request context token.
    requests: CancellationToken,
}

impl HttpServer {
    /// Create a new HTTP server serving `app` under the configured throttle.
    pub fn new(config: ServerConfig, app: Router) -> Result<Self, ThrottleError> {
        let controller = Arc::new(AdmissionController::from_config(&config.throttle)?);
        let requests = CancellationToken::new();
        let contexts = ContextSource::new(
            requests.clone(),
            Duration::from_secs(config.timeouts.request_secs),
        );

        let router = Self::build_router(&config, app, controller.clone(), contexts);
        Ok(Self {
            router,
            config,
            controller,
            requests,
        })
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(
        config: &ServerConfig,
        app: Router,
        controller: Arc<AdmissionController>,
        contexts: ContextSource,
    ) -> Router {
        app.layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.handler_secs)))
            .layer(ThrottleLayer::new(controller))
            .layer(middleware::from_fn_with_state(contexts, request_context_middleware))
            .layer(middleware::from_fn(track_metrics))
            .layer(TraceLayer::new_for_http().make_span_with(request_span))
            .layer(middleware::from_fn(request_id_middleware))
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` is triggered.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            limit = self.controller.limit(),
            backlog_limit = self.controller.backlog_limit(),
            "HTTP server starting"
        );

        if self.config.admin.enabled {
            spawn_admin(&self.config, self.controller.clone(), shutdown.clone()).await;
        }

        let requests = self.requests.clone();
        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.wait().await;
                tracing::info!("Draining: cancelling requests still waiting for admission");
                requests.cancel();
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// The fully layered router, for driving the stack without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

async fn spawn_admin(config: &ServerConfig, controller: Arc<AdmissionController>, shutdown: Shutdown) {
    let listener = match TcpListener::bind(&config.admin.bind_address).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(
                address = %config.admin.bind_address,
                error = %e,
                "Failed to bind admin API"
            );
            return;
        }
    };

    let app = setup_admin_router(AdminState::new(controller, config.admin.api_key.clone()));
    tracing::info!(address = %config.admin.bind_address, "Admin API listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
        {
            tracing::error!(error = %e, "Admin API stopped with error");
        }
    });
}

fn request_span(req: &Request) -> tracing::Span {
    let request_id = req.request_id().map(RequestId::as_str).unwrap_or("unknown");
    tracing::info_span!(
        "request",
        method = %req.method(),
        uri = %req.uri(),
        request_id = %request_id,
    )
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let request_id = req
        .request_id()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(req).await;
    let status = response.status();

    tracing::debug!(
        request_id = %request_id,
        method = %method,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Request finished"
    );
    metrics::record_request(method.as_str(), status.as_u16(), start);
    response
}
