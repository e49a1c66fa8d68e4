//! Request admission control ("throttle").
//!
//! # Data Flow
//! ```text
//! Incoming request
//!     → layer.rs (read RequestContext from extensions)
//!     → controller.rs (backlog permit → execution permit → dispatch)
//!         → pool.rs (backlog pool: limit + backlog_limit permits)
//!         → pool.rs (execution pool: limit permits)
//!     → wrapped handler
//!     → permits returned, execution first, then backlog
//!
//! Rejected request:
//!     → error.rs (CapacityExceeded | TimedOut | ContextCanceled)
//!     → backoff pause
//!     → 423 Locked with the rejection message
//! ```
//!
//! # Design Decisions
//! - Backlog admission never waits; saturation is reported immediately
//! - Only the execution permit is awaited, bounded by `backlog_timeout`
//!   and the caller's context
//! - Permits are RAII guards, so release happens exactly once per checkout

pub mod context;
pub mod controller;
pub mod error;
pub mod layer;
pub mod pool;

pub use context::RequestContext;
pub use controller::{AdmissionController, ThrottleStats};
pub use error::{CancelStage, Rejection, ThrottleError};
pub use layer::{RejectionBackoff, Throttle, ThrottleLayer};
pub use pool::{Permit, PermitPool, PoolKind};
