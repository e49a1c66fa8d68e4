//! Metrics collection and exposition.
//!
//! # Metrics
//! - `throttle_admissions_total` (counter): admission outcomes by `outcome`
//!   (`admitted`, `completed`, `capacity_exceeded`, `timed_out`,
//!   `context_canceled`)
//! - `throttle_backlog_wait_seconds` (histogram): time spent waiting for an
//!   execution permit
//! - `throttle_permits_in_use` (gauge): checked-out permits by `pool`
//! - `http_requests_total` / `http_request_duration_seconds`: per response
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op (tests, library use)
//! - The Prometheus exporter is only installed by the server binary

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::throttle::pool::PoolKind;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_admission(outcome: &'static str) {
    counter!("throttle_admissions_total", "outcome" => outcome).increment(1);
}

pub fn record_backlog_wait(waited: Duration) {
    histogram!("throttle_backlog_wait_seconds").record(waited.as_secs_f64());
}

pub fn record_permits_in_use(pool: PoolKind, in_use: usize) {
    gauge!("throttle_permits_in_use", "pool" => pool.as_str()).set(in_use as f64);
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    let method = method.to_string();
    let status = status.to_string();
    counter!("http_requests_total", "method" => method.clone(), "status" => status.clone())
        .increment(1);
    histogram!("http_request_duration_seconds", "method" => method, "status" => status)
        .record(start.elapsed().as_secs_f64());
}
