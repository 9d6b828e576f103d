//! Dual-mode lazy sequences.
//!
//! Every strategy implements [`Sequence`] once, against async cursors. A
//! suspending caller awaits [`collect`] / [`Cursor::advance`]; a blocking
//! caller uses [`collect_blocking`] or [`BlockingIter`], which drive the very
//! same futures to completion on a private current-thread runtime.
//!
//! Cursors are single-producer/single-consumer: `advance` takes `&mut self`, so
//! concurrent calls on one cursor cannot be expressed.

use std::collections::VecDeque;
use std::future::Future;

use async_trait::async_trait;

use shardex_common::{CancelToken, ShardexError, ShardexResult};

/// A position in a lazily produced sequence.
#[async_trait]
pub trait Cursor: Send {
    type Item: Send;

    /// The element under the cursor, `None` once exhausted (or already taken).
    fn current(&self) -> Option<&Self::Item>;

    /// Move the current element out.
    fn take_current(&mut self) -> Option<Self::Item>;

    /// Step to the next element. Returns `false` when the sequence is exhausted.
    async fn advance(&mut self) -> ShardexResult<bool>;
}

pub type BoxCursor<T> = Box<dyn Cursor<Item = T>>;

/// A sequence producer: one async construction step yielding a cursor already
/// positioned at the first element (or empty).
#[async_trait]
pub trait Sequence: Send + Sync {
    type Item: Send + 'static;

    async fn open(&self, cancel: CancelToken) -> ShardexResult<BoxCursor<Self::Item>>;
}

/// Drain a sequence into a vector.
pub async fn collect<S>(seq: &S, cancel: CancelToken) -> ShardexResult<Vec<S::Item>>
where
    S: Sequence + ?Sized,
{
    let mut cursor = seq.open(cancel).await?;
    drain(cursor.as_mut()).await
}

/// Drain an already opened cursor.
pub async fn drain<T: Send>(cursor: &mut dyn Cursor<Item = T>) -> ShardexResult<Vec<T>> {
    let mut out = Vec::new();
    while let Some(item) = cursor.take_current() {
        out.push(item);
        if !cursor.advance().await? {
            break;
        }
    }
    Ok(out)
}

/// First element of a sequence, if any. Later elements are never produced.
pub async fn first<S>(seq: &S, cancel: CancelToken) -> ShardexResult<Option<S::Item>>
where
    S: Sequence + ?Sized,
{
    let mut cursor = seq.open(cancel).await?;
    Ok(cursor.take_current())
}

/// Blocking twin of [`collect`].
pub fn collect_blocking<S>(seq: &S, cancel: CancelToken) -> ShardexResult<Vec<S::Item>>
where
    S: Sequence + ?Sized,
{
    block_on(collect(seq, cancel))
}

fn blocking_runtime() -> ShardexResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| ShardexError::Internal(format!("failed to build blocking runtime: {}", e)))
}

/// Drive `fut` to completion on the calling thread.
///
/// Panics (inside tokio) when called from within an async runtime; blocking
/// callers are expected to be plain threads.
pub fn block_on<T, F>(fut: F) -> ShardexResult<T>
where
    F: Future<Output = ShardexResult<T>>,
{
    blocking_runtime()?.block_on(fut)
}

/// Blocking iterator over a sequence. Each `next` drives one `advance`.
pub struct BlockingIter<T> {
    runtime: tokio::runtime::Runtime,
    cursor: Option<BoxCursor<T>>,
    started: bool,
}

impl<T: Send + 'static> BlockingIter<T> {
    pub fn open<S>(seq: &S, cancel: CancelToken) -> ShardexResult<Self>
    where
        S: Sequence<Item = T> + ?Sized,
    {
        let runtime = blocking_runtime()?;
        let cursor = runtime.block_on(seq.open(cancel))?;
        Ok(Self {
            runtime,
            cursor: Some(cursor),
            started: false,
        })
    }
}

impl<T: Send + 'static> Iterator for BlockingIter<T> {
    type Item = ShardexResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let cursor = self.cursor.as_mut()?;
        if self.started {
            match self.runtime.block_on(cursor.advance()) {
                Ok(true) => {}
                Ok(false) => {
                    self.cursor = None;
                    return None;
                }
                Err(e) => {
                    self.cursor = None;
                    return Some(Err(e));
                }
            }
        }
        self.started = true;
        match cursor.take_current() {
            Some(item) => Some(Ok(item)),
            None => {
                self.cursor = None;
                None
            }
        }
    }
}

/// Cursor over an already materialized batch.
pub struct VecCursor<T> {
    items: VecDeque<T>,
    current: Option<T>,
    cancel: CancelToken,
}

impl<T: Send> VecCursor<T> {
    /// Positioned at the first element.
    pub fn new(items: impl Into<VecDeque<T>>, cancel: CancelToken) -> Self {
        let mut items = items.into();
        let current = items.pop_front();
        Self {
            items,
            current,
            cancel,
        }
    }
}

#[async_trait]
impl<T: Send> Cursor for VecCursor<T> {
    type Item = T;

    fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<T> {
        self.current.take()
    }

    async fn advance(&mut self) -> ShardexResult<bool> {
        self.cancel.check()?;
        self.current = self.items.pop_front();
        Ok(self.current.is_some())
    }
}

/// Single-element cursor for scalar results (aggregates, paging results).
pub struct ScalarCursor<T> {
    value: Option<T>,
}

impl<T: Send> ScalarCursor<T> {
    pub fn new(value: T) -> Self {
        Self { value: Some(value) }
    }
}

#[async_trait]
impl<T: Send> Cursor for ScalarCursor<T> {
    type Item = T;

    fn current(&self) -> Option<&T> {
        self.value.as_ref()
    }

    fn take_current(&mut self) -> Option<T> {
        self.value.take()
    }

    async fn advance(&mut self) -> ShardexResult<bool> {
        self.value = None;
        Ok(false)
    }
}
