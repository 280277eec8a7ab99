use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Operation-counting shutdown guard.
///
/// Modules handling in-flight external operations hold one of these and
/// call [`DrainGuard::enter`] on operation entry; the returned permit is
/// released on drop. Once [`DrainGuard::close`] has been called, `enter`
/// refuses new operations, and the lifecycle manager waits (bounded) for
/// outstanding permits to drain before stopping the module.
#[derive(Debug, Default)]
pub struct DrainGuard {
    active: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl DrainGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a permit for one in-flight operation.
    /// Returns `None` once shutdown has been signaled.
    pub fn enter(self: &Arc<Self>) -> Option<OperationPermit> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        // Re-check: close() may have raced between the load and the increment.
        if self.closed.load(Ordering::Acquire) {
            self.release();
            return None;
        }
        Some(OperationPermit {
            guard: Arc::clone(self),
        })
    }

    /// Signal shutdown: no new permits will be granted.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.active.load(Ordering::Acquire) == 0 {
            self.idle.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of outstanding operations.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every outstanding permit has been released, up to
    /// `timeout`. Returns `true` if the guard drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                if self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                let notified = self.idle.notified();
                tokio::pin!(notified);
                // Register with the Notify before re-checking the counter;
                // notify_waiters only wakes already-registered waiters, so
                // a release landing between the check and the first poll
                // would otherwise be lost.
                notified.as_mut().enable();
                if self.active.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// RAII permit for one in-flight operation.
#[derive(Debug)]
pub struct OperationPermit {
    guard: Arc<DrainGuard>,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enter_fails_after_close() {
        let guard = Arc::new(DrainGuard::new());
        let permit = guard.enter();
        assert!(permit.is_some());

        guard.close();
        assert!(guard.enter().is_none());
        assert_eq!(guard.active(), 1);
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_release() {
        let guard = Arc::new(DrainGuard::new());
        let permit = guard.enter().unwrap();
        guard.close();

        // Still one outstanding operation, so a short wait times out.
        assert!(!guard.wait_idle(Duration::from_millis(20)).await);

        let g = guard.clone();
        let waiter = tokio::spawn(async move { g.wait_idle(Duration::from_secs(1)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);

        assert!(waiter.await.unwrap());
        assert_eq!(guard.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_idle_sees_releases_from_other_threads() {
        // The last permit may drop on another thread at any point during
        // wait_idle; a lost wakeup would surface here as a timed-out wait.
        for _ in 0..200 {
            let guard = Arc::new(DrainGuard::new());
            let permit = guard.enter().unwrap();
            guard.close();

            let dropper = tokio::spawn(async move {
                drop(permit);
            });
            assert!(guard.wait_idle(Duration::from_secs(1)).await);
            dropper.await.unwrap();
        }
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_unused() {
        let guard = Arc::new(DrainGuard::new());
        guard.close();
        assert!(guard.wait_idle(Duration::from_millis(1)).await);
    }
}
