//! Sorted merge for ordered plans whose shards are not range-partitioned on
//! the sort key: every shard sorts and limits its own rows, the coordinator
//! k-way merges the sorted batches.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;

use async_trait::async_trait;

use shardex_common::{CancelToken, OwnedRow, ShardexResult};

use crate::compiler::ShardQuery;
use crate::sequence::{BoxCursor, Cursor, VecCursor};

use super::{compare_rows, dispatch_rows, gather_all, resolve_sort_columns, SortColumns, StrategyContext, Window};

pub(crate) async fn open(ctx: &StrategyContext, cancel: CancelToken) -> ShardexResult<BoxCursor<OwnedRow>> {
    let model = ctx.model();
    let window = Window::for_model(model);
    if window.is_full() {
        return Ok(Box::new(VecCursor::new(Vec::new(), cancel)));
    }

    // Each shard returns at most skip+take rows: the global window can only
    // draw that many from any single shard.
    let query = ShardQuery::rows(ctx.plan.clone(), 0, window.shard_limit());
    let results = gather_all(dispatch_rows(ctx, &query, &cancel)).await?;

    let buffered: usize = results.iter().map(|r| r.value.rows.len()).sum();
    ctx.config.check_buffered(buffered)?;
    shardex_observability::record_rows_buffered("sorted_merge", buffered);

    let columns = match results.iter().find(|r| !r.value.columns.is_empty()) {
        Some(first) => first.value.columns.clone(),
        None => return Ok(Box::new(VecCursor::new(Vec::new(), cancel))),
    };
    let sort_columns = Arc::new(resolve_sort_columns(&columns, &model.ordering)?);
    tracing::debug!(
        table = %model.logical_table,
        shards = results.len(),
        buffered,
        "sorted merge"
    );

    let mut sources: Vec<std::vec::IntoIter<OwnedRow>> =
        results.into_iter().map(|r| r.value.rows.into_iter()).collect();
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (shard_idx, source) in sources.iter_mut().enumerate() {
        if let Some(row) = source.next() {
            heap.push(Reverse(MergeEntry {
                row,
                shard_idx,
                sort_columns: sort_columns.clone(),
            }));
        }
    }

    let mut cursor = MergeCursor {
        sources,
        heap,
        sort_columns,
        current: None,
        window,
        cancel,
    };
    cursor.advance().await?;
    Ok(Box::new(cursor))
}

struct MergeEntry {
    row: OwnedRow,
    shard_idx: usize,
    sort_columns: Arc<SortColumns>,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeEntry {}

impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties resolve by route position so the merge is deterministic.
        compare_rows(&self.row, &other.row, &self.sort_columns)
            .then(self.shard_idx.cmp(&other.shard_idx))
    }
}

struct MergeCursor {
    sources: Vec<std::vec::IntoIter<OwnedRow>>,
    heap: BinaryHeap<Reverse<MergeEntry>>,
    sort_columns: Arc<SortColumns>,
    current: Option<OwnedRow>,
    window: Window,
    cancel: CancelToken,
}

impl MergeCursor {
    fn finish(&mut self) -> bool {
        self.heap.clear();
        self.sources.clear();
        self.current = None;
        false
    }
}

#[async_trait]
impl Cursor for MergeCursor {
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
            let Some(Reverse(entry)) = self.heap.pop() else {
                return Ok(self.finish());
            };
            if let Some(next) = self.sources.get_mut(entry.shard_idx).and_then(|s| s.next()) {
                self.heap.push(Reverse(MergeEntry {
                    row: next,
                    shard_idx: entry.shard_idx,
                    sort_columns: self.sort_columns.clone(),
                }));
            }
            if let Some(row) = self.window.admit(entry.row) {
                self.current = Some(row);
                return Ok(true);
            }
        }
    }
}
