//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout log lines
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every event logged while serving a request sits inside a `request`
//!   span carrying its request ID (see `http::server`)
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
