//! Central scheduler for periodic and delayed work.
//!
//! Every recurring sweep in the system — ack-timeout redelivery, DLQ
//! purging, health checks, rate-bucket window trimming — is driven from
//! here instead of being scattered across the modules that need it. Each
//! scheduled task owns a [`CancellationToken`] so callers can stop it
//! without tearing down the whole scheduler, and ticks are idempotent: a
//! missed tick (the executor was busy, or the process was paused) just
//! means the next tick does the combined work of both.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Cooperative cancellation handle shared between a scheduled task and its owner.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, otherwise waits for `cancel()`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Handle to a task running on the [`Scheduler`]; cancels the task when
/// `cancel()` is called or the handle is dropped.
pub struct TaskHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Aborts the underlying task immediately rather than waiting for its
    /// next cancellation check. Useful in tests that don't want to wait a
    /// full period for a graceful stop.
    pub fn abort(&mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Owns all periodic and delayed work for the process. Does not itself use
/// [`crate::clock::Clock`] for scheduling — periodic ticks are driven by
/// `tokio::time`, which tests can pause/advance — but the work each tick
/// performs (e.g. "is this ack deadline past due?") is expressed in terms
/// of application timestamps taken from a `Clock`, so that comparison stays
/// deterministic under a virtual clock.
#[derive(Clone, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Runs `task` once after `delay`, unless cancelled first.
    pub fn after<F>(&self, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel_wait = token.clone();
        let join = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = cancel_wait.cancelled() => {}
            }
        });
        TaskHandle { token, join: Some(join) }
    }

    /// Runs `task` every `period` until cancelled. `task` is re-invoked via
    /// `make_task` on every tick since each run needs its own future.
    pub fn every<F, Fut>(&self, period: Duration, mut make_task: F) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel_wait = token.clone();
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if cancel_wait.is_cancelled() {
                            break;
                        }
                        make_task().await;
                    }
                    _ = cancel_wait.cancelled() => break,
                }
            }
        });
        TaskHandle { token, join: Some(join) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn after_runs_once_past_delay() {
        let scheduler = Scheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let _handle = scheduler.after(Duration::from_millis(50), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_runs_repeatedly_until_cancelled() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let mut handle = scheduler.every(Duration::from_millis(10), move || {
            let t = t.clone();
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        handle.abort();
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn cancellation_token_resolves_immediately_once_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }
}
