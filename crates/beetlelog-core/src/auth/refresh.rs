//! Single-flight coordination of token refreshes.
//!
//! When the access token expires, every request in flight fails at roughly
//! the same moment. Only the first of them starts a refresh; the rest join the
//! pending one and all of them observe the same outcome.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error};

type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;
type Slot = Arc<Mutex<Option<PendingRefresh>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<PendingRefresh>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the slot when the refresh task finishes, panics or is dropped
struct SlotRelease {
    slot: Slot,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        lock(&self.slot).take();
    }
}

/// Holds at most one outstanding refresh.
///
/// The refresh runs on its own task, so dropping a waiter never cancels it
/// and never strands the other waiters.
#[derive(Default)]
pub struct RefreshCoordinator {
    slot: Slot,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Join the refresh in flight, or start one with `start` if there is none.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run<F, Fut>(&self, start: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        let pending = {
            let mut slot = lock(&self.slot);
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.clone()
                }
                None => {
                    debug!("Starting token refresh");
                    let release = SlotRelease {
                        slot: Arc::clone(&self.slot),
                    };
                    let refresh = start();
                    // The slot lock is held until the pending future is stored,
                    // so the release cannot run before the slot is filled.
                    let task = tokio::spawn(async move {
                        let _release = release;
                        refresh.await
                    });
                    let pending = async move {
                        task.await.unwrap_or_else(|e| {
                            error!(error = %e, "Token refresh task failed");
                            None
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let waiters = (0..5).map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            async move {
                coordinator
                    .run(move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some("A2".to_string())
                    })
                    .await
            }
        });
        let results = join_all(waiters).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_deref() == Some("A2")));
        assert!(!coordinator.is_in_flight());
    }

    #[tokio::test]
    async fn test_slot_clears_so_later_refresh_runs_again() {
        let coordinator = RefreshCoordinator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let counter = Arc::clone(&calls);
            let result = coordinator
                .run(move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                })
                .await;
            assert_eq!(result, None);
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_cancel_refresh() {
        let coordinator = Arc::new(RefreshCoordinator::new());
        let gate = Arc::new(Notify::new());

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                coordinator
                    .run(move || async move {
                        gate.notified().await;
                        Some("A2".to_string())
                    })
                    .await
            })
        };
        while !coordinator.is_in_flight() {
            tokio::task::yield_now().await;
        }
        first.abort();
        let _ = first.await;

        let second = coordinator.run(|| async { Some("unused".to_string()) });
        tokio::pin!(second);
        assert!(futures::poll!(&mut second).is_pending());
        gate.notify_one();

        assert_eq!(second.await.as_deref(), Some("A2"));
        assert!(!coordinator.is_in_flight());
    }

    async fn exploding_refresh() -> Option<String> {
        panic!("refresh blew up");
    }

    #[tokio::test]
    async fn test_panicking_refresh_releases_slot() {
        let coordinator = RefreshCoordinator::new();
        let result = coordinator.run(exploding_refresh).await;
        assert_eq!(result, None);
        assert!(!coordinator.is_in_flight());
    }
}
