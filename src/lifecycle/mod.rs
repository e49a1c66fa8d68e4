//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → cancel request contexts → stop accepting → drain → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Requests still waiting in the backlog are answered with
//!   `ContextCanceled` on shutdown instead of holding the drain open

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
