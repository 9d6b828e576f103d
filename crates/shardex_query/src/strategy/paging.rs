//! Paging: a LongCount aggregate for the totals composed with a data
//! strategy for the requested window.

use async_trait::async_trait;

use shardex_common::{CancelToken, OwnedRow, ShardexResult};

use crate::compiler::ShardQuery;
use crate::sequence::{drain, BoxCursor, ScalarCursor, Sequence};

use super::aggregate::shard_counts;
use super::{dispatch_rows, gather_all, merge, ordered, PagingData, StrategyContext, Window};

/// One page of a paginated query plus the total number of matching rows.
#[derive(Debug, Clone, PartialEq)]
pub struct PagingResult {
    /// Rows matching the predicate, independent of the requested window.
    pub totals: i64,
    pub data_list: Vec<OwnedRow>,
}

pub(crate) async fn run(ctx: &StrategyContext, data: PagingData, cancel: &CancelToken) -> ShardexResult<PagingResult> {
    let model = ctx.model();
    let counts = shard_counts(ctx, cancel).await?;
    let totals: u64 = counts.iter().sum();

    let window_empty = model.take == Some(0) || model.skip >= totals;
    let data_list = if window_empty {
        Vec::new()
    } else {
        match data {
            PagingData::OrderedMerge => {
                let mut cursor = ordered::open(ctx, cancel.clone(), Some(counts)).await?;
                drain(cursor.as_mut()).await?
            }
            PagingData::SortedMerge => {
                let mut cursor = merge::open(ctx, cancel.clone()).await?;
                drain(cursor.as_mut()).await?
            }
            PagingData::InMemory => in_memory(ctx, cancel).await?,
        }
    };
    tracing::debug!(
        table = %model.logical_table,
        totals,
        skip = model.skip,
        take = ?model.take,
        rows = data_list.len(),
        "page served"
    );
    Ok(PagingResult {
        totals: totals as i64,
        data_list,
    })
}

/// Unordered fallback: every matching row is materialized, then windowed.
/// Memory grows with the total match count, not with the page size.
async fn in_memory(ctx: &StrategyContext, cancel: &CancelToken) -> ShardexResult<Vec<OwnedRow>> {
    let query = ShardQuery::rows(ctx.plan.clone(), 0, None);
    let results = gather_all(dispatch_rows(ctx, &query, cancel)).await?;
    let rows: Vec<OwnedRow> = results.into_iter().flat_map(|r| r.value.rows).collect();

    ctx.config.check_buffered(rows.len())?;
    shardex_observability::record_rows_buffered("paging", rows.len());
    let warn_at = ctx.config.warn_rows_buffered;
    if warn_at > 0 && rows.len() > warn_at {
        tracing::warn!(
            table = %ctx.model().logical_table,
            rows = rows.len(),
            warn_rows_buffered = warn_at,
            "unordered paging materialized a large result; add an ordering to page by merge"
        );
    }
    Ok(Window::for_model(ctx.model()).apply(rows))
}

pub struct PagingSequence {
    ctx: StrategyContext,
    data: PagingData,
}

impl PagingSequence {
    pub fn new(ctx: StrategyContext, data: PagingData) -> Self {
        Self { ctx, data }
    }
}

#[async_trait]
impl Sequence for PagingSequence {
    type Item = PagingResult;

    async fn open(&self, cancel: CancelToken) -> ShardexResult<BoxCursor<PagingResult>> {
        cancel.check()?;
        let page = run(&self.ctx, self.data, &cancel).await?;
        Ok(Box::new(ScalarCursor::new(page)))
    }
}
