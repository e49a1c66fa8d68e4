//! Request throttler server.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌───────────────────────────────────────────────────────┐
//!                 │                   REQUEST THROTTLER                   │
//!                 │                                                       │
//!   Client ──────▶│  request ID ─▶ context ─▶ ┌──────────────┐            │
//!                 │                           │   throttle   │            │
//!                 │                           │ backlog pool │─▶ handlers │
//!                 │                           │  exec pool   │            │
//!   Client ◀──────│◀── 423 Locked on reject ──└──────────────┘            │
//!                 │                                                       │
//!                 │  config · logging · metrics · admin API · shutdown    │
//!                 └───────────────────────────────────────────────────────┘
//! ```
//!
//! The handlers mounted here are placeholders; real page handlers are
//! supplied by the embedding application.

use axum::{extract::Query, routing::get, Router};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use request_throttler::config::{load_config, ServerConfig};
use request_throttler::lifecycle::signals::trigger_on_signal;
use request_throttler::observability::{logging, metrics};
use request_throttler::{HttpServer, Shutdown};

#[derive(Parser)]
#[command(name = "request-throttler")]
#[command(about = "HTTP server with bounded concurrency and a finite request backlog")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Deserialize)]
struct WorkParams {
    #[serde(default)]
    ms: u64,
}

/// Simulated work: sleeps for `?ms=` milliseconds.
async fn work(Query(params): Query<WorkParams>) -> String {
    tokio::time::sleep(Duration::from_millis(params.ms)).await;
    format!("done after {}ms\n", params.ms)
}

fn app() -> Router {
    Router::new()
        .route("/", get(|| async { "ok\n" }))
        .route("/work", get(work))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!("request-throttler v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        limit = config.throttle.limit,
        backlog_limit = config.throttle.backlog_limit,
        backlog_timeout_ms = config.throttle.backlog_timeout_ms,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::new(config, app())?;

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move { trigger_on_signal(&signal_shutdown).await });

    server.run(listener, shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
