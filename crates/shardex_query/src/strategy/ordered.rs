//! Ordered merge over value-range partitioned shards.
//!
//! Shards are walked one at a time in range order (reversed for a descending
//! primary key), each already returning its rows in order, so concatenation
//! is the global order. A shard is only queried once every earlier shard has
//! been consumed and the window still needs rows.

use std::collections::VecDeque;

use async_trait::async_trait;

use shardex_common::{CancelToken, OwnedRow, ShardTable, ShardexError, ShardexResult};

use crate::compiler::ShardQuery;
use crate::routing::range_order;
use crate::sequence::{BoxCursor, Cursor};

use super::aggregate::shard_counts;
use super::{StrategyContext, Window};

/// Open the merge. `counts` (rows per shard table, in route order) lets shards
/// that lie entirely before the window be skipped without being queried; when
/// absent and the plan skips rows, a LongCount pre-count supplies them.
pub(crate) async fn open(
    ctx: &StrategyContext,
    cancel: CancelToken,
    counts: Option<Vec<u64>>,
) -> ShardexResult<BoxCursor<OwnedRow>> {
    let model = ctx.model();
    let tables = ctx.tables();
    let order = range_order(tables, ctx.plan.primary_direction());

    let counts = match counts {
        Some(counts) => Some(counts),
        None if model.skip > 0 && !model.distinct => Some(shard_counts(ctx, &cancel).await?),
        None => None,
    };

    let (shards, window) = match counts.filter(|_| !model.distinct) {
        Some(counts) => {
            if counts.len() != tables.len() {
                return Err(ShardexError::internal_bug(
                    "E-ORDERED-001",
                    "shard counts do not line up with the route",
                    format!("counts={} tables={}", counts.len(), tables.len()),
                ));
            }
            let mut skip_left = model.skip;
            let mut shards = VecDeque::new();
            for idx in order {
                let rows = counts[idx];
                if rows <= skip_left {
                    skip_left -= rows;
                    continue;
                }
                shards.push_back((tables[idx].clone(), skip_left));
                skip_left = 0;
            }
            // Offsets were pushed to the shards; only the take remains global.
            (shards, Window::new(0, model.take, false))
        }
        None => (
            order.into_iter().map(|idx| (tables[idx].clone(), 0)).collect(),
            Window::for_model(model),
        ),
    };

    tracing::debug!(
        table = %model.logical_table,
        shards = shards.len(),
        skip = model.skip,
        take = ?model.take,
        "ordered merge"
    );
    let mut cursor = OrderedCursor {
        ctx: ctx.clone(),
        cancel,
        shards,
        batch: VecDeque::new(),
        current: None,
        window,
    };
    cursor.advance().await?;
    Ok(Box::new(cursor))
}

struct OrderedCursor {
    ctx: StrategyContext,
    cancel: CancelToken,
    /// Remaining shards in traversal order, with the offset to push down.
    shards: VecDeque<(ShardTable, u64)>,
    batch: VecDeque<OwnedRow>,
    current: Option<OwnedRow>,
    window: Window,
}

impl OrderedCursor {
    fn finish(&mut self) -> bool {
        self.shards.clear();
        self.batch.clear();
        self.current = None;
        false
    }
}

#[async_trait]
impl Cursor for OrderedCursor {
    type Item = OwnedRow;

    fn current(&self) -> Option<&OwnedRow> {
        self.current.as_ref()
    }

    fn take_current(&mut self) -> Option<OwnedRow> {
        self.current.take()
    }

    async fn advance(&mut self) -> ShardexResult<bool> {
        self.cancel.check()?;
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
            let Some((table, offset)) = self.shards.pop_front() else {
                return Ok(self.finish());
            };
            let query = ShardQuery::rows(self.ctx.plan.clone(), offset, self.window.shard_limit());
            let partial = self
                .ctx
                .executor
                .query_rows(&query, &table, &self.cancel)
                .await?;
            self.batch.extend(partial.value.rows);
        }
    }
}
