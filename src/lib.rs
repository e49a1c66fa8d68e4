//! Request admission control for HTTP services.
//!
//! The core is [`throttle::AdmissionController`]: a bounded set of
//! execution permits plus a bounded backlog of requests waiting for one.
//! [`throttle::ThrottleLayer`] applies it to any tower service.

pub mod admin;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod throttle;

pub use config::schema::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use throttle::{AdmissionController, Rejection, RequestContext, ThrottleLayer};
