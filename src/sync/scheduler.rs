use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::sync::clock::Clock;
use crate::sync::lock::{LockGuard, SyncLock};
use crate::sync::notify::Notifier;
use crate::sync::pass::PassRunner;

/// Timer of the next scheduled pass.
struct PendingTimer {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    runner: Arc<dyn PassRunner>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    lock: Arc<SyncLock>,
    /// Pause before the self-scheduled next pass; `None` runs passes only on request.
    interval: Option<Duration>,
    stale_after: TimeDelta,
    timer: Mutex<Option<PendingTimer>>,
    shutting_down: AtomicBool,
    running: AtomicBool,
    passes: AtomicU64,
}

/// Single-flight background scheduler of sync passes.
///
/// `request_pass` grabs the global sync lock without blocking and arms a timer; the timer
/// runs one pass, releases the lock and re-arms itself after the steady-state interval. A
/// lock held for longer than `interval * stale_lock_multiple` is treated as orphaned and
/// reset by the next request. An [`on_demand`](Self::on_demand) scheduler does not re-arm
/// and only runs requested passes.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

impl SyncScheduler {
    pub fn new(
        runner: Arc<dyn PassRunner>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        stale_lock_multiple: u32,
    ) -> Self {
        let stale_after = interval.saturating_mul(stale_lock_multiple.max(1));
        Self::build(runner, clock, notifier, Some(interval), stale_after)
    }

    /// Scheduler that runs a pass per granted request and never re-arms itself.
    pub fn on_demand(
        runner: Arc<dyn PassRunner>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        stale_after: Duration,
    ) -> Self {
        Self::build(runner, clock, notifier, None, stale_after)
    }

    fn build(
        runner: Arc<dyn PassRunner>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        interval: Option<Duration>,
        stale_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                clock,
                notifier,
                lock: Arc::new(SyncLock::new()),
                interval,
                stale_after: TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::MAX),
                timer: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                running: AtomicBool::new(false),
                passes: AtomicU64::new(0),
            }),
        }
    }

    /// Schedules a pass in `delay`. Returns `false` when a pass is already scheduled or
    /// running, or after shutdown.
    pub fn request_pass(&self, delay: Duration) -> bool {
        self.inner.request_pass(delay)
    }

    /// A pass is scheduled or running.
    pub fn is_locked(&self) -> bool {
        self.inner.lock.is_held()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn passes_completed(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// Cancels a pending timer and waits for an in-flight pass to finish.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        loop {
            let pending = match self.inner.timer.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let Some(pending) = pending else { break };
            let _ = pending.stop_tx.send(());
            if let Err(e) = pending.handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "sync task ended abnormally");
            }
        }
        info!(passes = self.passes_completed(), "sync scheduler stopped");
    }
}

impl Inner {
    fn request_pass(self: &Arc<Self>, delay: Duration) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let now = self.clock.now();
        self.recover_stale_lock(now);

        let grant = match self.lock.try_acquire(now) {
            Ok(Some(grant)) => grant,
            Ok(None) => {
                debug!(?delay, "sync pass already scheduled or running");
                return false;
            }
            Err(e) => {
                error!(error = %e, "sync lock unusable");
                return false;
            }
        };
        let guard = LockGuard::new(Arc::clone(&self.lock), grant);

        let mut slot = match self.timer.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        // checked again under the slot lock so that shutdown sees every armed timer
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_scheduled(delay, stop_rx, guard).await });
        *slot = Some(PendingTimer { stop_tx, handle });
        debug!(?delay, token = grant.token, "sync pass scheduled");
        true
    }

    /// Resets a lock held past the stale timeout and aborts its task.
    fn recover_stale_lock(&self, now: chrono::NaiveDateTime) {
        let stale = match self.lock.stale_grant(now, self.stale_after) {
            Ok(Some(grant)) => grant,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "sync lock unusable");
                return;
            }
        };
        warn!(
            granted_at = %stale.granted_at,
            timeout = %self.stale_after,
            "sync lock timed out; resetting"
        );
        self.notifier.notify(
            "sync lock reset",
            &format!("sync lock granted at {} was held longer than {}", stale.granted_at, self.stale_after),
        );
        if let Ok(mut slot) = self.timer.lock()
            && let Some(pending) = slot.take()
        {
            pending.handle.abort();
        }
        if let Err(e) = self.lock.force_reset() {
            error!(error = %e, "sync lock reset failed");
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn run_scheduled(self: Arc<Self>, delay: Duration, mut stop_rx: oneshot::Receiver<()>, guard: LockGuard) {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!(token = guard.grant().token, "scheduled sync pass cancelled");
                return;
            }
            _ = sleep(delay) => {}
        }

        self.running.store(true, Ordering::SeqCst);
        let result = AssertUnwindSafe(self.runner.run_pass()).catch_unwind().await;
        self.running.store(false, Ordering::SeqCst);
        self.passes.fetch_add(1, Ordering::SeqCst);
        drop(guard);

        match result {
            Ok(outcome) => {
                if let Some(e) = outcome.error {
                    self.notifier
                        .notify("sync pass failed", &format!("stopped after {} syncs: {}", outcome.synced, e));
                }
            }
            Err(_) => {
                error!("sync pass panicked");
                self.notifier.notify("sync pass panicked", "the pass was aborted; lock released");
            }
        }

        if let Some(interval) = self.interval
            && !self.shutting_down.load(Ordering::SeqCst)
            && !self.request_pass(interval)
        {
            debug!("next sync pass already requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::SystemClock;
    use crate::sync::notify::LogNotifier;
    use crate::sync::pass::PassOutcome;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Gate {
        release: Notify,
        entered: AtomicU64,
    }

    #[async_trait]
    impl PassRunner for Gate {
        async fn run_pass(&self) -> PassOutcome {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            PassOutcome::default()
        }
    }

    fn scheduler(runner: Arc<dyn PassRunner>) -> SyncScheduler {
        SyncScheduler::new(runner, Arc::new(SystemClock), Arc::new(LogNotifier), Duration::from_secs(3600), 18)
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_second_request_is_rejected_while_scheduled() {
        let gate = Arc::new(Gate::default());
        let scheduler = scheduler(gate.clone());
        assert!(scheduler.request_pass(Duration::ZERO));
        assert!(!scheduler.request_pass(Duration::ZERO));

        wait_for(|| scheduler.is_running()).await;
        assert!(!scheduler.request_pass(Duration::ZERO));

        gate.release.notify_one();
        // the finished pass re-armed itself with the steady-state interval
        wait_for(|| scheduler.passes_completed() == 1 && scheduler.is_locked()).await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_locked());
        assert_eq!(gate.entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_pass() {
        let gate = Arc::new(Gate::default());
        let scheduler = scheduler(gate.clone());
        scheduler.request_pass(Duration::ZERO);
        wait_for(|| scheduler.is_running()).await;

        let stopping = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.shutdown().await })
        };
        sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        gate.release.notify_one();
        stopping.await.unwrap();
        assert_eq!(scheduler.passes_completed(), 1);
        assert!(!scheduler.request_pass(Duration::ZERO));
    }

    struct Panics;

    #[async_trait]
    impl PassRunner for Panics {
        async fn run_pass(&self) -> PassOutcome {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panicking_pass_releases_lock() {
        let scheduler = scheduler(Arc::new(Panics));
        scheduler.request_pass(Duration::ZERO);
        wait_for(|| scheduler.passes_completed() == 1).await;
        scheduler.shutdown().await;
        assert!(!scheduler.is_locked());
    }
}
