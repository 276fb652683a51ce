//! Cooperative cancellation for batch jobs.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Something a running batch must keep extending, such as a lease.
pub trait KeepAlive: Send + Sync {
    /// Extend the hold. An error means it was lost and the batch must stop.
    fn renew(&self) -> Result<()>;
}

/// Cloneable cancellation signal.
///
/// Engines call [`CancelToken::checkpoint`] between units of work; a unit
/// already running is allowed to finish so that no half-written item is
/// left behind.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
    keep_alive: Option<Arc<dyn KeepAlive>>,
    lost: Arc<AtomicBool>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("keep_alive", &self.keep_alive.is_some())
            .field("lost", &self.lost.load(Ordering::SeqCst))
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for one batch that also renews `keep_alive` at every checkpoint.
    ///
    /// Cancelling either token cancels both. Losing the keep-alive stops
    /// only the returned token.
    pub fn with_keep_alive(&self, keep_alive: Arc<dyn KeepAlive>) -> Self {
        Self {
            inner: self.inner.clone(),
            keep_alive: Some(keep_alive),
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst) || self.lost.load(Ordering::SeqCst)
    }

    /// Whether the keep-alive failed to renew.
    pub fn keep_alive_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Called between units of work. Returns `false` when the batch must stop.
    pub fn checkpoint(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if let Some(ref keep_alive) = self.keep_alive {
            if let Err(e) = keep_alive.renew() {
                warn!(error = %e, "Keep-alive lost, stopping batch");
                self.lost.store(true, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.cancelled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already-cancelled tokens return immediately
        token.cancelled().await;
    }

    /// Renews successfully `budget` times, then fails.
    struct Budgeted {
        budget: usize,
        renewals: AtomicUsize,
    }

    impl KeepAlive for Budgeted {
        fn renew(&self) -> Result<()> {
            let n = self.renewals.fetch_add(1, Ordering::SeqCst);
            if n < self.budget {
                Ok(())
            } else {
                Err(Error::Internal("lease gone".into()))
            }
        }
    }

    #[test]
    fn test_checkpoint_renews_until_keep_alive_is_lost() {
        let parent = CancelToken::new();
        let keep_alive = Arc::new(Budgeted {
            budget: 2,
            renewals: AtomicUsize::new(0),
        });
        let token = parent.with_keep_alive(keep_alive.clone());

        assert!(token.checkpoint());
        assert!(token.checkpoint());
        assert!(!token.checkpoint());
        assert!(token.is_cancelled());
        assert!(token.keep_alive_lost());
        assert_eq!(keep_alive.renewals.load(Ordering::SeqCst), 3);

        // The caller's token is untouched
        assert!(!parent.is_cancelled());
        assert!(parent.checkpoint());
    }

    #[test]
    fn test_parent_cancel_reaches_batch_token() {
        let parent = CancelToken::new();
        let token = parent.with_keep_alive(Arc::new(Budgeted {
            budget: usize::MAX,
            renewals: AtomicUsize::new(0),
        }));
        parent.cancel();
        assert!(!token.checkpoint());
        assert!(!token.keep_alive_lost());
    }
}
