//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, layer stack)
//!     → request.rs (request ID, request context)
//!     → throttle (admission)
//!     → application router
//!     → Send to client
//! ```

pub mod request;
pub mod server;

pub use request::{ContextSource, RequestId, RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
