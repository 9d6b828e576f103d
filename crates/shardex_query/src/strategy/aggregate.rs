//! Scalar aggregates: one partial per shard, combined at the coordinator.

use async_trait::async_trait;

use shardex_common::{CancelToken, Datum, ShardexError, ShardexResult};

use crate::compiler::ShardQuery;
use crate::executor::PartialResult;
use crate::plan::{AggregateOp, AggregateSpec, PartialAggregate};
use crate::sequence::{BoxCursor, ScalarCursor, Sequence};

use super::{dispatch_aggregates, gather_all, StrategyContext};

/// Run `spec` on every shard concurrently and combine. Any shard failure
/// fails the whole aggregate.
pub(crate) async fn run(ctx: &StrategyContext, spec: &AggregateSpec, cancel: &CancelToken) -> ShardexResult<Datum> {
    let query = ShardQuery::aggregate(ctx.plan.clone(), spec.op, spec.column.clone());
    let partials = gather_all(dispatch_aggregates(ctx, &query, cancel)).await?;
    let values: Vec<_> = partials.into_iter().map(|p| p.value).collect();
    let combined = spec.op.combine(&values)?;
    tracing::debug!(
        table = %ctx.model().logical_table,
        op = %spec.op,
        shards = values.len(),
        result = %combined,
        "aggregate combined"
    );
    Ok(combined)
}

/// LongCount per shard table, in route order.
pub(crate) async fn shard_counts(ctx: &StrategyContext, cancel: &CancelToken) -> ShardexResult<Vec<u64>> {
    let query = ShardQuery::aggregate(ctx.plan.clone(), AggregateOp::LongCount, None);
    let partials = gather_all(dispatch_aggregates(ctx, &query, cancel)).await?;
    partials.iter().map(shard_count).collect()
}

/// Row count reported by one shard. Anything but a non-negative integer (or
/// NULL for an empty table) is that shard's failure.
fn shard_count(partial: &PartialResult<PartialAggregate>) -> ShardexResult<u64> {
    let n = match &partial.value.value {
        Datum::Null => return Ok(0),
        v => v.as_i64().ok_or_else(|| {
            ShardexError::shard_failure(&partial.table, format!("count returned non-integer {}", v))
        })?,
    };
    u64::try_from(n)
        .map_err(|_| ShardexError::shard_failure(&partial.table, format!("count returned negative {}", n)))
}

/// One-element sequence holding the combined aggregate.
pub struct AggregateSequence {
    ctx: StrategyContext,
    spec: AggregateSpec,
}

impl AggregateSequence {
    pub fn new(ctx: StrategyContext, spec: AggregateSpec) -> Self {
        Self { ctx, spec }
    }
}

#[async_trait]
impl Sequence for AggregateSequence {
    type Item = Datum;

    async fn open(&self, cancel: CancelToken) -> ShardexResult<BoxCursor<Datum>> {
        cancel.check()?;
        let value = run(&self.ctx, &self.spec, &cancel).await?;
        Ok(Box::new(ScalarCursor::new(value)))
    }
}
