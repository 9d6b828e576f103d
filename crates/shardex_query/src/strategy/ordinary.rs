//! Ordinary scatter-gather: every shard concurrently, rows streamed in
//! completion order.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use shardex_common::{CancelToken, OwnedRow, ShardexResult};

use crate::compiler::ShardQuery;
use crate::executor::ShardRows;
use crate::sequence::{BoxCursor, Cursor};

use super::{dispatch_rows, ShardFutures, StrategyContext, Window};

pub(crate) async fn open(ctx: &StrategyContext, cancel: CancelToken) -> ShardexResult<BoxCursor<OwnedRow>> {
    let window = Window::for_model(ctx.model());
    let pending = if window.is_full() {
        FuturesUnordered::new()
    } else {
        let query = ShardQuery::rows(ctx.plan.clone(), 0, window.shard_limit());
        dispatch_rows(ctx, &query, &cancel)
    };
    tracing::debug!(
        table = %ctx.model().logical_table,
        shards = pending.len(),
        "ordinary scatter"
    );
    let mut cursor = OrdinaryCursor {
        pending,
        batch: VecDeque::new(),
        current: None,
        window,
        cancel,
    };
    cursor.advance().await?;
    Ok(Box::new(cursor))
}

struct OrdinaryCursor {
    pending: ShardFutures<ShardRows>,
    batch: VecDeque<OwnedRow>,
    current: Option<OwnedRow>,
    window: Window,
    cancel: CancelToken,
}

impl OrdinaryCursor {
    fn finish(&mut self) -> bool {
        // Dropping the in-flight statements cancels them and returns their connections.
        self.pending = FuturesUnordered::new();
        self.batch.clear();
        self.current = None;
        false
    }
}

#[async_trait]
impl Cursor for OrdinaryCursor {
    type Item = OwnedRow;

    fn current(&self) -> Option<&OwnedRow> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<OwnedRow> {
        self.current.take()
    }

    async fn advance(&mut self) -> ShardexResult<bool> {
        if let Err(e) = self.cancel.check() {
            self.finish();
            return Err(e);
        }
        loop {
            if self.window.is_full() {
                return Ok(self.finish());
            }
            if let Some(row) = self.batch.pop_front() {
                if let Some(row) = self.window.admit(row) {
                    self.current = Some(row);
                    return Ok(true);
                }
                continue;
            }
            match self.pending.next().await {
                Some(Ok((_, partial))) => self.batch.extend(partial.value.rows),
                Some(Err(e)) => {
                    if !self.pending.is_empty() {
                        tracing::debug!(
                            aborted = self.pending.len(),
                            error = %e,
                            "aborting sibling shard statements"
                        );
                    }
                    self.finish();
                    return Err(e);
                }
                None => return Ok(self.finish()),
            }
        }
    }
}
