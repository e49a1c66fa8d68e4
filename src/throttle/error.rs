//! Admission rejections and construction errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

pub const CAPACITY_EXCEEDED_MSG: &str = "Server capacity exceeded.";
pub const TIMED_OUT_MSG: &str = "Timed out while waiting for a pending request to complete.";
pub const CONTEXT_CANCELED_MSG: &str = "Context was canceled.";

/// Where in the admission sequence a cancellation was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStage {
    /// The context was already done on arrival; no permit was touched.
    BeforeBacklog,
    /// The context became done while holding a backlog permit.
    InBacklog,
}

/// Why a request was not admitted. Terminal for that request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Backlog pool exhausted.
    #[error("Server capacity exceeded.")]
    CapacityExceeded,

    /// No execution permit within the backlog wait window.
    #[error("Timed out while waiting for a pending request to complete.")]
    TimedOut { waited: Duration },

    /// Caller gave up before or during admission.
    #[error("Context was canceled.")]
    ContextCanceled { stage: CancelStage },
}

impl Rejection {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::CapacityExceeded => "capacity_exceeded",
            Rejection::TimedOut { .. } => "timed_out",
            Rejection::ContextCanceled { .. } => "context_canceled",
        }
    }

    /// Body sent to the client.
    pub fn message(&self) -> &'static str {
        match self {
            Rejection::CapacityExceeded => CAPACITY_EXCEEDED_MSG,
            Rejection::TimedOut { .. } => TIMED_OUT_MSG,
            Rejection::ContextCanceled { .. } => CONTEXT_CANCELED_MSG,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::LOCKED
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status(), self.message()).into_response()
    }
}

/// Errors raised while building an admission controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThrottleError {
    #[error("throttle limit must be at least 1, got {0}")]
    InvalidLimit(usize),

    #[error("limit + backlog_limit must not exceed {max}, got {limit} + {backlog_limit}")]
    PoolTooLarge {
        limit: usize,
        backlog_limit: usize,
        max: usize,
    },
}
