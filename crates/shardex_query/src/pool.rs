//! Bounded pool of reusable execution resources (one per shard connection).
//!
//! The pool owns a fixed set of resources. A caller checks one out, uses it
//! exclusively, and hands it back; when no resource is free the caller waits
//! in FIFO order. A released resource goes straight to the longest waiter so a
//! caller that never queued cannot overtake it.
//!
//! The free queue, the waiter queue and the disposed flag live behind one
//! `parking_lot::Mutex`: acquire and release are atomic with respect to each
//! other, so a wakeup can never be lost between "no resource" and "enqueue".

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use shardex_common::{CancelToken, PoolError, ShardexError, ShardexResult};

use crate::sequence::block_on;

/// Observable pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of resources the pool was created with.
    pub size: usize,
    /// Resources sitting in the free queue.
    pub available: usize,
    /// Resources currently held by callers.
    pub checked_out: usize,
    /// Callers queued for a resource.
    pub waiting: usize,
    /// Successful checkouts since creation.
    pub total_acquires: u64,
    /// Checkouts that had to queue.
    pub total_waits: u64,
}

struct PoolState<T> {
    free: VecDeque<T>,
    waiters: VecDeque<oneshot::Sender<T>>,
    checked_out: usize,
    disposed: bool,
}

struct PoolInner<T> {
    name: String,
    size: usize,
    state: Mutex<PoolState<T>>,
    total_acquires: AtomicU64,
    total_waits: AtomicU64,
}

impl<T> PoolInner<T> {
    /// Return a resource: hand it to the longest waiter, else queue it as free.
    /// After disposal the resource is dropped instead.
    fn release(&self, resource: T) {
        let mut resource = resource;
        let mut state = self.state.lock();
        if state.disposed {
            state.checked_out = state.checked_out.saturating_sub(1);
            drop(state);
            drop(resource);
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(resource) {
                // Ownership moves to the waiter; checked_out is unchanged.
                Ok(()) => return,
                // Waiter gave up (cancelled or dropped): try the next one.
                Err(back) => resource = back,
            }
        }
        state.checked_out = state.checked_out.saturating_sub(1);
        state.free.push_back(resource);
    }
}

/// A bounded, FIFO-fair pool of `T`.
pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(name: impl Into<String>, resources: Vec<T>) -> Self {
        let size = resources.len();
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                size,
                state: Mutex::new(PoolState {
                    free: resources.into(),
                    waiters: VecDeque::new(),
                    checked_out: 0,
                    disposed: false,
                }),
                total_acquires: AtomicU64::new(0),
                total_waits: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Check out a resource, suspending in FIFO order while none is free.
    ///
    /// Fails with `PoolError::Closed` if the pool is (or becomes) disposed, and
    /// with the token's error if `cancel` fires while waiting.
    pub async fn acquire(&self, cancel: &CancelToken) -> ShardexResult<Pooled<T>> {
        cancel.check()?;
        let receiver = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(PoolError::Closed(self.inner.name.clone()).into());
            }
            if let Some(resource) = state.free.pop_front() {
                state.checked_out += 1;
                drop(state);
                self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
                return Ok(Pooled::new(resource, self.inner.clone()));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        self.inner.total_waits.fetch_add(1, Ordering::Relaxed);
        shardex_observability::record_pool_wait(&self.inner.name);
        tracing::debug!(pool = %self.inner.name, "pool exhausted, queued for a resource");

        let mut waiter = Waiter {
            receiver: Some(receiver),
            pool: self.inner.clone(),
        };
        let resource = tokio::select! {
            biased;
            received = waiter.recv() => received,
            _ = cancel.cancelled() => return Err(cancel.error()),
        }?;
        self.inner.total_acquires.fetch_add(1, Ordering::Relaxed);
        Ok(Pooled::new(resource, self.inner.clone()))
    }

    /// Blocking twin of [`acquire`](Self::acquire). Must not be called from
    /// inside an async runtime.
    pub fn acquire_blocking(&self, cancel: &CancelToken) -> ShardexResult<Pooled<T>> {
        block_on(self.acquire(cancel))
    }

    /// Close the pool: free resources are dropped, every queued waiter fails
    /// with `PoolError::Closed`, and resources still checked out are dropped
    /// when their holders release them. Idempotent.
    pub fn dispose(&self) {
        let (free, waiters) = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (
                std::mem::take(&mut state.free),
                std::mem::take(&mut state.waiters),
            )
        };
        tracing::info!(
            pool = %self.inner.name,
            dropped = free.len(),
            failed_waiters = waiters.len(),
            "resource pool disposed"
        );
        // Dropping a sender resolves its receiver with an error -> PoolError::Closed.
        drop(waiters);
        drop(free);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            size: self.inner.size,
            available: state.free.len(),
            checked_out: state.checked_out,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total_acquires: self.inner.total_acquires.load(Ordering::Relaxed),
            total_waits: self.inner.total_waits.load(Ordering::Relaxed),
        }
    }
}

/// A queued acquire. If it is abandoned after a resource was already handed
/// over, the resource goes back to the pool instead of being lost.
struct Waiter<T> {
    receiver: Option<oneshot::Receiver<T>>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Waiter<T> {
    async fn recv(&mut self) -> ShardexResult<T> {
        let receiver = self.receiver.as_mut().ok_or_else(|| {
            ShardexError::internal_bug("E-POOL-001", "waiter polled after completion", "")
        })?;
        let result = receiver.await;
        self.receiver = None;
        result.map_err(|_| PoolError::Closed(self.pool.name.clone()).into())
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if let Ok(resource) = receiver.try_recv() {
                self.pool.release(resource);
            }
        }
    }
}

/// Exclusive handle to one checked-out resource. Returned to the pool on drop.
pub struct Pooled<T> {
    resource: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Pooled<T> {
    fn new(resource: T, pool: Arc<PoolInner<T>>) -> Self {
        Self {
            resource: Some(resource),
            pool,
        }
    }

    /// Explicitly hand the resource back. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name)
            .field("resource", &self.resource)
            .finish()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Only `Drop` takes the resource out.
        self.resource.as_ref().unwrap_or_else(|| unreachable!("pooled resource taken"))
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().unwrap_or_else(|| unreachable!("pooled resource taken"))
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
