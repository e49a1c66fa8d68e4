//! Fixed-size permit pools.
//!
//! # Responsibilities
//! - Pre-fill a pool with `capacity` permits at construction
//! - Hand out permits either non-blocking or with a wait
//! - Return permits to the pool when their guard is dropped
//!
//! # Design Decisions
//! - Backed by a `tokio::sync::Semaphore`; a permit is a checked-out unit
//! - Check-in happens in `Drop`, so it runs on every exit path (error,
//!   cancellation, panic unwind)
//! - No permit is ever added after construction: `available + in_use`
//!   always equals `capacity`

use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::observability::metrics;

/// Which of the two admission pools a permit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Right to run inside the wrapped handler.
    Execution,
    /// Right to wait for an execution permit.
    Backlog,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Execution => "execution",
            PoolKind::Backlog => "backlog",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pool's semaphore was closed. Pools are never closed while a
/// controller is alive, so callers treat this as saturation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} permit pool is closed")]
pub struct PoolClosed(pub PoolKind);

/// Largest number of permits a single pool can hold.
pub const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

/// Size of the backlog pool for a controller: `limit + backlog_limit`, or
/// `None` when that sum overflows or exceeds [`MAX_CAPACITY`].
pub fn backlog_capacity(limit: usize, backlog_limit: usize) -> Option<usize> {
    limit
        .checked_add(backlog_limit)
        .filter(|&total| total <= MAX_CAPACITY)
}

/// A bounded pool of indistinguishable permits.
#[derive(Debug, Clone)]
pub struct PermitPool {
    kind: PoolKind,
    capacity: usize,
    permits: Arc<Semaphore>,
}

impl PermitPool {
    /// Create a pool holding `capacity` permits, all available.
    ///
    /// `capacity` must not exceed [`MAX_CAPACITY`]; see [`backlog_capacity`].
    pub fn new(kind: PoolKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Take a permit if one is free right now.
    pub fn try_checkout(&self) -> Option<Permit> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Some(self.issue(permit)),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => {
                tracing::error!(pool = %self.kind, "Permit pool closed");
                None
            }
        }
    }

    /// Wait until a permit is free and take it.
    ///
    /// Cancel-safe: dropping the returned future before it resolves leaves
    /// the pool untouched.
    pub async fn checkout(&self) -> Result<Permit, PoolClosed> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed(self.kind))?;
        Ok(self.issue(permit))
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> Permit {
        metrics::record_permits_in_use(self.kind, self.in_use());
        Permit {
            pool: self.clone(),
            permit: Some(permit),
        }
    }

    /// Number of permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Number of permits currently checked out.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Total permits in circulation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }
}

/// A checked-out permit. Returned to its pool when dropped.
#[derive(Debug)]
pub struct Permit {
    pool: PermitPool,
    permit: Option<OwnedSemaphorePermit>,
}

impl Permit {
    pub fn kind(&self) -> PoolKind {
        self.pool.kind
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Release first so the gauge sees the post-check-in count.
        drop(self.permit.take());
        metrics::record_permits_in_use(self.pool.kind, self.pool.in_use());
        tracing::trace!(pool = %self.pool.kind, available = self.pool.available(), "Permit returned");
    }
}
