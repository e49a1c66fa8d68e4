//! Admission controller.
//!
//! # Admission sequence
//! ```text
//! Arrived
//!   → context done?            → Rejected(ContextCanceled)
//!   → backlog permit (no wait) → Rejected(CapacityExceeded)
//!   → race within backlog_timeout:
//!         context done         → Rejected(ContextCanceled)
//!         execution permit     → Dispatched → Completed
//!         timer                → Rejected(TimedOut)
//! ```
//!
//! Permits are RAII guards. The execution permit is dropped before the
//! backlog permit, and both are dropped on every early return, on panic
//! unwind, and when the caller drops the admission future.

use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::ThrottleConfig;
use crate::observability::metrics;
use crate::throttle::context::RequestContext;
use crate::throttle::error::{CancelStage, Rejection, ThrottleError};
use crate::throttle::layer::RejectionBackoff;
use crate::throttle::pool::{self, Permit, PermitPool, PoolKind};

/// Bounds concurrently executing requests and the backlog waiting for them.
#[derive(Debug)]
pub struct AdmissionController {
    capacity: PermitPool,
    backlog: PermitPool,
    limit: usize,
    backlog_limit: usize,
    backlog_timeout: Duration,
    backoff: RejectionBackoff,
}

/// Point-in-time view of both pools.
///
/// The two pools are read one after the other, so under load the numbers
/// may be off by the requests that moved in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub limit: usize,
    pub backlog_limit: usize,
    pub backlog_timeout_ms: u64,
    /// Requests inside the wrapped handler.
    pub executing: usize,
    /// Requests holding a backlog permit but no execution permit.
    pub waiting: usize,
    pub available_execution: usize,
    pub available_backlog: usize,
}

impl AdmissionController {
    /// Build a controller with `limit` execution permits and
    /// `limit + backlog_limit` backlog permits.
    pub fn new(
        limit: usize,
        backlog_limit: usize,
        backlog_timeout: Duration,
    ) -> Result<Self, ThrottleError> {
        if limit < 1 {
            tracing::error!(limit, "Throttle expects limit > 0");
            return Err(ThrottleError::InvalidLimit(limit));
        }

        let Some(backlog_size) = pool::backlog_capacity(limit, backlog_limit) else {
            tracing::error!(
                limit,
                backlog_limit,
                max = pool::MAX_CAPACITY,
                "Throttle pools exceed the permit ceiling"
            );
            return Err(ThrottleError::PoolTooLarge {
                limit,
                backlog_limit,
                max: pool::MAX_CAPACITY,
            });
        };

        tracing::info!(
            limit,
            backlog_limit,
            backlog_timeout_ms = backlog_timeout.as_millis() as u64,
            "Admission controller created"
        );

        Ok(Self {
            capacity: PermitPool::new(PoolKind::Execution, limit),
            backlog: PermitPool::new(PoolKind::Backlog, backlog_size),
            limit,
            backlog_limit,
            backlog_timeout,
            backoff: RejectionBackoff::default(),
        })
    }

    /// Build a controller from the `[throttle]` config section.
    pub fn from_config(config: &ThrottleConfig) -> Result<Self, ThrottleError> {
        Ok(Self::new(
            config.limit,
            config.backlog_limit,
            Duration::from_millis(config.backlog_timeout_ms),
        )?
        .with_backoff(RejectionBackoff::from_config(config)))
    }

    /// Replace the pause applied before rejection responses.
    pub fn with_backoff(mut self, backoff: RejectionBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run `dispatch` once both a backlog and an execution permit are held.
    ///
    /// The dispatched future's output is returned untouched; the controller
    /// never inspects it.
    pub async fn admit<F, Fut>(
        &self,
        ctx: &RequestContext,
        dispatch: F,
    ) -> Result<Fut::Output, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        if ctx.is_done() {
            return Err(self.reject(Rejection::ContextCanceled {
                stage: CancelStage::BeforeBacklog,
            }));
        }

        let backlog_permit = match self.backlog.try_checkout() {
            Some(permit) => permit,
            None => return Err(self.reject(Rejection::CapacityExceeded)),
        };

        let execution_permit = self.await_execution(ctx).await?;

        metrics::record_admission("admitted");
        let output = dispatch().await;

        drop(execution_permit);
        drop(backlog_permit);
        metrics::record_admission("completed");

        Ok(output)
    }

    /// Backlog wait window. Caller holds a backlog permit for the duration.
    async fn await_execution(&self, ctx: &RequestContext) -> Result<Permit, Rejection> {
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;

            _ = ctx.done() => Err(Rejection::ContextCanceled {
                stage: CancelStage::InBacklog,
            }),
            permit = self.capacity.checkout() => permit.map_err(|e| {
                tracing::error!(error = %e, "Execution pool unavailable");
                Rejection::CapacityExceeded
            }),
            _ = tokio::time::sleep(self.backlog_timeout) => Err(Rejection::TimedOut {
                waited: started.elapsed(),
            }),
        };

        metrics::record_backlog_wait(started.elapsed());
        outcome.map_err(|rejection| self.reject(rejection))
    }

    fn reject(&self, rejection: Rejection) -> Rejection {
        tracing::warn!(
            reason = rejection.kind(),
            executing = self.capacity.in_use(),
            backlog_in_use = self.backlog.in_use(),
            "Request rejected by throttle"
        );
        metrics::record_admission(rejection.kind());
        rejection
    }

    pub fn stats(&self) -> ThrottleStats {
        let executing = self.capacity.in_use();
        let backlog_in_use = self.backlog.in_use();
        ThrottleStats {
            limit: self.limit,
            backlog_limit: self.backlog_limit,
            backlog_timeout_ms: self.backlog_timeout.as_millis() as u64,
            executing,
            waiting: backlog_in_use.saturating_sub(executing),
            available_execution: self.capacity.available(),
            available_backlog: self.backlog.available(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    pub fn backlog_timeout(&self) -> Duration {
        self.backlog_timeout
    }

    pub fn backoff(&self) -> RejectionBackoff {
        self.backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    fn controller(limit: usize, backlog: usize, timeout_ms: u64) -> Arc<AdmissionController> {
        Arc::new(AdmissionController::new(limit, backlog, Duration::from_millis(timeout_ms)).unwrap())
    }

    /// Admit a request whose handler blocks until the returned sender fires.
    async fn hold_slot(
        ctrl: &Arc<AdmissionController>,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), Rejection>>) {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (entered_tx, entered_rx) = oneshot::channel::<()>();
        let ctrl = ctrl.clone();
        let handle = tokio::spawn(async move {
            ctrl.admit(&RequestContext::default(), || async move {
                let _ = entered_tx.send(());
                let _ = release_rx.await;
            })
            .await
        });
        entered_rx.await.unwrap();
        (release_tx, handle)
    }

    fn assert_full(ctrl: &AdmissionController) {
        let stats = ctrl.stats();
        assert_eq!(stats.available_execution, stats.limit);
        assert_eq!(stats.available_backlog, stats.limit + stats.backlog_limit);
        assert_eq!(stats.executing, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = AdmissionController::new(0, 5, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, ThrottleError::InvalidLimit(0));
    }

    #[test]
    fn oversized_pools_are_rejected() {
        let too_big = pool::MAX_CAPACITY + 1;
        let err = AdmissionController::new(too_big, 0, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, ThrottleError::PoolTooLarge { limit, .. } if limit == too_big));

        let err = AdmissionController::new(1, pool::MAX_CAPACITY, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ThrottleError::PoolTooLarge { backlog_limit, .. }
            if backlog_limit == pool::MAX_CAPACITY));

        // limit + backlog_limit wraps around usize.
        let err = AdmissionController::new(usize::MAX, usize::MAX, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, ThrottleError::PoolTooLarge { .. }));
    }

    #[test]
    fn largest_pools_are_accepted() {
        let ctrl = AdmissionController::new(1, pool::MAX_CAPACITY - 1, Duration::from_millis(10))
            .unwrap();
        assert_eq!(ctrl.stats().available_backlog, pool::MAX_CAPACITY);
    }

    #[test]
    fn pools_are_prefilled() {
        let ctrl = controller(4, 6, 100);
        let stats = ctrl.stats();
        assert_eq!(stats.available_execution, 4);
        assert_eq!(stats.available_backlog, 10);
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn admitted_request_returns_handler_output() {
        let ctrl = controller(1, 0, 100);
        let out = ctrl
            .admit(&RequestContext::default(), || async { Err::<(), &str>("handler failed") })
            .await
            .unwrap();
        assert_eq!(out, Err("handler failed"));
        assert_full(&ctrl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_limit() {
        let limit = 3;
        let ctrl = controller(limit, 100, 5_000);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let ctrl = ctrl.clone();
            let current = current.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let inner = ctrl.clone();
                ctrl.admit(&RequestContext::default(), || async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    // This task holds a permit, so at least one is gone.
                    assert!(inner.stats().available_execution < limit);

                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for result in futures_util::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= limit);
        assert_eq!(peak.load(Ordering::SeqCst), limit);
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn permits_are_conserved_with_parked_waiters() {
        let (limit, backlog_limit) = (2, 3);
        let ctrl = controller(limit, backlog_limit, 10_000);

        let mut holders = Vec::new();
        for _ in 0..limit {
            holders.push(hold_slot(&ctrl).await);
        }

        let finished = Arc::new(AtomicUsize::new(0));
        let waiters: Vec<_> = (0..backlog_limit)
            .map(|_| {
                let ctrl = ctrl.clone();
                let finished = finished.clone();
                tokio::spawn(async move {
                    ctrl.admit(&RequestContext::default(), || async move {
                        finished.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
                })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Counted from the tasks we started, not from the pools.
        let executing = holders.len();
        let parked = waiters.iter().filter(|w| !w.is_finished()).count();
        assert_eq!(parked, backlog_limit);

        let stats = ctrl.stats();
        assert_eq!(stats.available_execution + executing, limit);
        assert_eq!(
            stats.available_backlog + executing + parked,
            limit + backlog_limit
        );
        assert_eq!(
            ctrl.admit(&RequestContext::default(), || async {}).await,
            Err(Rejection::CapacityExceeded)
        );

        for (release, holder) in holders {
            release.send(()).unwrap();
            holder.await.unwrap().unwrap();
        }
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), backlog_limit);
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn full_backlog_rejects_immediately() {
        let ctrl = controller(1, 1, 5_000);
        let (release, holder) = hold_slot(&ctrl).await;

        let waiter = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.admit(&RequestContext::default(), || async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctrl.stats().waiting, 1);

        let start = Instant::now();
        let res = ctrl.admit(&RequestContext::default(), || async {}).await;
        assert_eq!(res, Err(Rejection::CapacityExceeded));
        assert!(start.elapsed() < Duration::from_millis(100));

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        waiter.await.unwrap().unwrap();
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn backlog_wait_times_out_at_window() {
        let ctrl = controller(1, 1, 50);
        let (release, holder) = hold_slot(&ctrl).await;

        let start = Instant::now();
        let res = ctrl.admit(&RequestContext::default(), || async {}).await;
        let elapsed = start.elapsed();

        assert!(matches!(res, Err(Rejection::TimedOut { .. })));
        assert!(elapsed >= Duration::from_millis(50), "rejected early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "rejected late: {:?}", elapsed);

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn cancel_in_backlog_frees_the_slot() {
        let ctrl = controller(1, 1, 10_000);
        let (release, holder) = hold_slot(&ctrl).await;

        let token = CancellationToken::new();
        let canceled = {
            let ctrl = ctrl.clone();
            let ctx = RequestContext::new(token.clone());
            tokio::spawn(async move { ctrl.admit(&ctx, || async {}).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctrl.stats().available_backlog, 0);

        token.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), canceled)
            .await
            .expect("cancellation should end the wait")
            .unwrap();
        assert_eq!(
            res,
            Err(Rejection::ContextCanceled { stage: CancelStage::InBacklog })
        );
        assert_eq!(ctrl.stats().available_backlog, 1);

        // The freed backlog slot is usable right away.
        let next = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move { ctrl.admit(&RequestContext::default(), || async { 7 }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!next.is_finished());

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(next.await.unwrap(), Ok(7));
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn done_context_touches_no_permits() {
        let ctrl = controller(1, 0, 100);
        let token = CancellationToken::new();
        token.cancel();

        let called = AtomicUsize::new(0);
        let counter = &called;
        let res = ctrl
            .admit(&RequestContext::new(token), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert_eq!(
            res,
            Err(Rejection::ContextCanceled { stage: CancelStage::BeforeBacklog })
        );
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn expired_deadline_counts_as_canceled() {
        let ctrl = controller(1, 0, 100);
        let ctx = RequestContext::default().with_deadline(tokio::time::Instant::now());
        let res = ctrl.admit(&ctx, || async {}).await;
        assert!(matches!(res, Err(Rejection::ContextCanceled { .. })));
    }

    #[tokio::test]
    async fn caller_deadline_can_beat_backlog_timeout() {
        let ctrl = controller(1, 1, 10_000);
        let (release, holder) = hold_slot(&ctrl).await;

        let ctx = RequestContext::default()
            .with_deadline(tokio::time::Instant::now() + Duration::from_millis(30));
        let res = ctrl.admit(&ctx, || async {}).await;
        assert_eq!(
            res,
            Err(Rejection::ContextCanceled { stage: CancelStage::InBacklog })
        );

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_full(&ctrl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_rejection_leaks_nothing() {
        let ctrl = controller(1, 0, 1);

        let mut tasks = Vec::with_capacity(10_000);
        for _ in 0..10_000 {
            let ctrl = ctrl.clone();
            tasks.push(tokio::spawn(async move {
                ctrl.admit(&RequestContext::default(), || {
                    tokio::time::sleep(Duration::from_millis(5))
                })
                .await
            }));
        }

        let mut admitted = 0;
        for result in futures_util::future::join_all(tasks).await {
            if result.unwrap().is_ok() {
                admitted += 1;
            }
        }

        assert!(admitted >= 1);
        assert_full(&ctrl);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn two_served_one_timed_out() {
        let ctrl = controller(2, 1, 50);
        let start = Instant::now();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let ctrl = ctrl.clone();
                tokio::spawn(async move {
                    let res = ctrl
                        .admit(&RequestContext::default(), || {
                            tokio::time::sleep(Duration::from_millis(100))
                        })
                        .await;
                    (res, start.elapsed())
                })
            })
            .collect();

        let mut served = 0;
        let mut timed_out = 0;
        for task in tasks {
            let (res, at) = task.await.unwrap();
            match res {
                Ok(()) => {
                    served += 1;
                    assert!(at >= Duration::from_millis(100));
                }
                Err(Rejection::TimedOut { .. }) => {
                    timed_out += 1;
                    assert!(at >= Duration::from_millis(50));
                    assert!(at < Duration::from_millis(100));
                }
                Err(other) => panic!("unexpected rejection: {other:?}"),
            }
        }

        assert_eq!(served, 2);
        assert_eq!(timed_out, 1);
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn panicking_handler_returns_permits() {
        let ctrl = controller(1, 0, 100);
        let task = {
            let ctrl = ctrl.clone();
            tokio::spawn(async move {
                ctrl.admit(&RequestContext::default(), || async {
                    panic!("handler blew up");
                })
                .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());
        assert_full(&ctrl);
    }

    #[tokio::test]
    async fn dropped_waiter_returns_backlog_permit() {
        let ctrl = controller(1, 1, 10_000);
        let (release, holder) = hold_slot(&ctrl).await;

        let res = tokio::time::timeout(
            Duration::from_millis(20),
            ctrl.admit(&RequestContext::default(), || async {}),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(ctrl.stats().available_backlog, 1);

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_full(&ctrl);
    }
}
