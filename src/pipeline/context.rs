//! Per-run context threaded through executor, scheduler and runner

use crate::clock::Clock;
use crate::pipeline::execution::{HaltReason, Stamp};
use crate::trace::{TraceCollector, TraceEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Create a linked cancellation pair
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelToken { rx })
}

/// Raises the cancellation signal
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observes the cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is raised; never resolves if the handle is gone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Everything a component needs to know about the run it works for
#[derive(Clone)]
pub struct RunContext {
    run_id: Uuid,
    origin: Instant,
    deadline: Instant,
    clock: Arc<dyn Clock>,
    trace: Arc<TraceCollector>,
    cancel: CancelToken,
}

impl RunContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        trace: Arc<TraceCollector>,
        deadline: Instant,
        cancel: CancelToken,
    ) -> Self {
        Self {
            run_id: trace.run_id(),
            origin: trace.origin(),
            deadline,
            clock,
            trace,
            cancel,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn trace(&self) -> &Arc<TraceCollector> {
        &self.trace
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.clock.now(), self.origin, self.clock.wall())
    }

    /// Budget left before the global deadline
    pub fn remaining(&self) -> Duration {
        crate::clock::remaining_until(self.clock.as_ref(), self.deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the cancellation signal was raised, judged from the clock
    pub fn interruption(&self) -> HaltReason {
        if self.remaining().is_zero() {
            HaltReason::DeadlineExceeded
        } else {
            HaltReason::Cancelled
        }
    }

    pub fn record(&self, event: TraceEvent) {
        self.trace.append(event);
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[test]
    fn test_cancel_token_observes_handle() {
        let (handle, token) = cancellation();
        assert!(!token.is_cancelled());

        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        handle.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_never_cancels() {
        let (handle, token) = cancellation();
        drop(handle);

        let outcome = tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await;
        assert!(outcome.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_budget_counts_down() {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let trace = Arc::new(TraceCollector::new(Uuid::new_v4(), clock.clone()));
        let deadline = clock.now() + Duration::from_secs(1);
        let (_handle, token) = cancellation();
        let ctx = RunContext::new(clock.clone(), trace, deadline, token);

        assert_eq!(ctx.remaining(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(ctx.remaining(), Duration::from_millis(600));
        assert_eq!(ctx.stamp().offset, Duration::from_millis(400));
    }
}
