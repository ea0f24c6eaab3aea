//! Binary acquisition slots.
//!
//! A [`Slot`] serializes access to one resource the way a capacity-1
//! token channel would: at most one holder, acquisition that can be
//! abandoned when the caller's scope cancels or the connection closes,
//! and an idempotent release so the close path and the reader pump may
//! free a slot on a holder's behalf. A plain mutex cannot express either
//! property.

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const FREE: u8 = 0;
const TAKEN: u8 = 1;
/// Sticky-taken: set at close so no acquirer can slip past the closed
/// latch once the connection is torn down.
const POISONED: u8 = 2;

/// Why an acquisition did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireError {
    /// The caller's scope was cancelled.
    Cancelled,
    /// The connection closed; the caller should surface the terminal error.
    Closed,
}

pub(crate) struct Slot {
    state: AtomicU8,
    freed: Notify,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(FREE),
            freed: Notify::new(),
        }
    }

    fn try_take(&self) -> bool {
        self.state
            .compare_exchange(FREE, TAKEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire the slot, suspending until it frees, `scope` cancels, or
    /// `closed` fires. The closed latch wins ties.
    pub(crate) async fn acquire(
        &self,
        scope: &CancellationToken,
        closed: &CancellationToken,
    ) -> Result<(), AcquireError> {
        loop {
            if closed.is_cancelled() {
                return Err(AcquireError::Closed);
            }
            if self.try_take() {
                return Ok(());
            }
            let freed = self.freed.notified();
            tokio::select! {
                biased;
                _ = closed.cancelled() => return Err(AcquireError::Closed),
                _ = scope.cancelled() => return Err(AcquireError::Cancelled),
                _ = freed => {}
            }
        }
    }

    /// Release the slot. Releasing a free or poisoned slot is a no-op, so
    /// a release on someone else's behalf can never double-free.
    pub(crate) fn release(&self) {
        if self
            .state
            .compare_exchange(TAKEN, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.freed.notify_one();
        }
    }

    /// Mark the slot permanently taken. Every later acquire falls through
    /// to the closed latch and returns the terminal error.
    pub(crate) fn poison(&self) {
        self.state.store(POISONED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn idle() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_acquire_free_slot() {
        let slot = Slot::new();
        assert_eq!(slot.acquire(&idle(), &idle()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let slot = Arc::new(Slot::new());
        slot.acquire(&idle(), &idle()).await.unwrap();

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.acquire(&idle(), &idle()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        slot.release();
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_acquire_cancelled_by_scope() {
        let slot = Slot::new();
        slot.acquire(&idle(), &idle()).await.unwrap();

        let scope = CancellationToken::new();
        scope.cancel();
        assert_eq!(
            slot.acquire(&scope, &idle()).await,
            Err(AcquireError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_acquire_unblocked_by_close() {
        let slot = Arc::new(Slot::new());
        slot.acquire(&idle(), &idle()).await.unwrap();

        let closed = CancellationToken::new();
        let waiter = {
            let slot = slot.clone();
            let closed = closed.clone();
            tokio::spawn(async move { slot.acquire(&idle(), &closed).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        closed.cancel();
        assert_eq!(waiter.await.unwrap(), Err(AcquireError::Closed));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let slot = Slot::new();
        slot.acquire(&idle(), &idle()).await.unwrap();
        slot.release();
        slot.release();
        // Still only one acquisition possible after the double release.
        slot.acquire(&idle(), &idle()).await.unwrap();
        let scope = CancellationToken::new();
        scope.cancel();
        assert_eq!(
            slot.acquire(&scope, &idle()).await,
            Err(AcquireError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_poison_is_sticky() {
        let slot = Slot::new();
        let closed = CancellationToken::new();
        slot.poison();
        slot.release();

        closed.cancel();
        assert_eq!(
            slot.acquire(&idle(), &closed).await,
            Err(AcquireError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_under_contention() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let slot = Arc::new(Slot::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..16 {
            let slot = slot.clone();
            let inside = inside.clone();
            tasks.spawn(async move {
                for _ in 0..100 {
                    slot.acquire(&idle(), &idle()).await.unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::task::yield_now().await;
                    assert_eq!(inside.fetch_sub(1, Ordering::SeqCst), 1);
                    slot.release();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
    }
}
