//! Cooperative cancellation for query execution.
//!
//! One token flows from the caller through every per-shard task and every
//! pool wait. Cancelling wakes all suspended waiters immediately; an optional
//! deadline turns the token into a caller-supplied timeout.
//!
//! # Usage
//! ```ignore
//! let cancel = CancelToken::with_timeout(Duration::from_secs(5));
//! let rows = query.to_list(&cancel).await?;
//!
//! // From another task:
//! cancel.cancel(); // every pending shard statement and pool wait aborts
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{ShardexError, ShardexResult};

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// A token that is never cancelled unless `cancel()` is called.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                deadline,
            }),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Request cancellation. Wakes all waiters immediately.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once cancelled or past the deadline (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst) || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.inner.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The error to surface for this token. Explicit cancel wins over deadline.
    pub fn error(&self) -> ShardexError {
        if self.inner.flag.load(Ordering::SeqCst) {
            ShardexError::Cancelled
        } else {
            ShardexError::DeadlineExceeded
        }
    }

    /// `Err` if the token has fired.
    pub fn check(&self) -> ShardexResult<()> {
        if self.is_cancelled() {
            Err(self.error())
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a concurrent cancel() is not lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline.into()) => return,
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Run `fut` unless the token fires first; the losing future is dropped.
    pub async fn guard<T, F>(&self, fut: F) -> ShardexResult<T>
    where
        F: Future<Output = ShardexResult<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.error()),
            result = fut => result,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.inner.flag.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
