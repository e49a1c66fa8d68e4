//! Shared utilities for integration testing.

use axum::{extract::Query, routing::get, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use request_throttler::{AdmissionController, HttpServer, ServerConfig, Shutdown};

#[derive(Deserialize)]
struct SleepParams {
    #[serde(default)]
    ms: u64,
}

/// Application whose `/sleep?ms=N` handler takes N milliseconds.
pub fn sleepy_app() -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route(
            "/sleep",
            get(|Query(p): Query<SleepParams>| async move {
                tokio::time::sleep(Duration::from_millis(p.ms)).await;
                "slept"
            }),
        )
}

/// Config with the given throttle sizes and no rejection backoff.
pub fn throttle_config(limit: usize, backlog_limit: usize, backlog_timeout_ms: u64) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.throttle.limit = limit;
    config.throttle.backlog_limit = backlog_limit;
    config.throttle.backlog_timeout_ms = backlog_timeout_ms;
    config.throttle.rejection_backoff_ms = 0;
    config.throttle.early_cancel_backoff_ms = 0;
    config.observability.metrics_enabled = false;
    config
}

pub struct RunningServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub controller: Arc<AdmissionController>,
    pub client: reqwest::Client,
}

impl RunningServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Start the server on an ephemeral loopback port.
pub async fn start_server(config: ServerConfig) -> RunningServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config, sleepy_app()).unwrap();
    let controller = server.controller().clone();
    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.clone();

    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap();

    RunningServer {
        addr,
        shutdown,
        controller,
        client,
    }
}
