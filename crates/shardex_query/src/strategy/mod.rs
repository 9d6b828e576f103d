//! Execution strategies: a closed set of variants selected from the frozen
//! plan's shape, each producing a dual-mode sequence.
//!
//! | plan shape                                   | strategy       |
//! |----------------------------------------------|----------------|
//! | scalar aggregate                             | `Aggregate`    |
//! | paging terminal                              | `Paging`       |
//! | GROUP BY                                     | `Grouped`      |
//! | ordering on the route's range column         | `OrderedMerge` |
//! | any other ordering                           | `SortedMerge`  |
//! | no ordering                                  | `Ordinary`     |

pub mod aggregate;
pub mod grouped;
pub mod merge;
pub mod ordered;
pub mod ordinary;
pub mod paging;

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;

use shardex_common::{
    CancelToken, ExecutionConfig, OwnedRow, PlanError, ShardTable, ShardexError, ShardexResult,
    SortDirection,
};

use crate::compiler::ShardQuery;
use crate::executor::{PartialResult, ShardExecutor, ShardRows};
use crate::plan::{AggregateSpec, OrderKey, PartialAggregate, QueryModel, QueryPlan};
use crate::sequence::{BoxCursor, Sequence};

pub use aggregate::AggregateSequence;
pub use paging::{PagingResult, PagingSequence};

/// How the caller will consume the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Rows,
    Scalar,
    Paging,
}

/// Data path of a paging query. Totals always come from a LongCount aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingData {
    /// Range-ordered traversal; shards before the window are skipped by count.
    OrderedMerge,
    /// Ordered, but not on the routing column: pushdown + heap merge.
    SortedMerge,
    /// Unordered: fetch every matching row, window in memory.
    InMemory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStrategy {
    Ordinary,
    OrderedMerge,
    SortedMerge,
    Grouped,
    Aggregate(AggregateSpec),
    Paging(PagingData),
}

impl ExecutionStrategy {
    /// Pick the strategy for a frozen plan.
    pub fn select(plan: &QueryPlan, terminal: Terminal) -> ShardexResult<Self> {
        let model = &plan.model;
        let strategy = if let Some(spec) = &model.aggregate {
            ExecutionStrategy::Aggregate(spec.clone())
        } else if terminal == Terminal::Scalar {
            return Err(ShardexError::internal_bug(
                "E-STRATEGY-001",
                "scalar terminal on a plan without an aggregate",
                format!("table={}", model.logical_table),
            ));
        } else if terminal == Terminal::Paging {
            if !model.group_by.is_empty() {
                return Err(PlanError::Unsupported("paging a grouped query".into()).into());
            }
            if model.distinct {
                return Err(PlanError::Unsupported("paging a distinct query".into()).into());
            }
            if plan.is_ordered_tables() {
                ExecutionStrategy::Paging(PagingData::OrderedMerge)
            } else if !model.ordering.is_empty() {
                ExecutionStrategy::Paging(PagingData::SortedMerge)
            } else {
                ExecutionStrategy::Paging(PagingData::InMemory)
            }
        } else if !model.group_by.is_empty() {
            ExecutionStrategy::Grouped
        } else if plan.is_ordered_tables() {
            ExecutionStrategy::OrderedMerge
        } else if !model.ordering.is_empty() {
            ExecutionStrategy::SortedMerge
        } else {
            ExecutionStrategy::Ordinary
        };
        shardex_observability::record_strategy(strategy.name());
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutionStrategy::Ordinary => "ordinary",
            ExecutionStrategy::OrderedMerge => "ordered_merge",
            ExecutionStrategy::SortedMerge => "sorted_merge",
            ExecutionStrategy::Grouped => "grouped",
            ExecutionStrategy::Aggregate(_) => "aggregate",
            ExecutionStrategy::Paging(_) => "paging",
        }
    }
}

/// Everything a strategy needs to run one frozen plan.
#[derive(Clone)]
pub struct StrategyContext {
    pub executor: Arc<ShardExecutor>,
    pub plan: Arc<QueryPlan>,
    pub config: ExecutionConfig,
}

impl StrategyContext {
    pub fn new(executor: Arc<ShardExecutor>, plan: Arc<QueryPlan>, config: ExecutionConfig) -> Self {
        Self {
            executor,
            plan,
            config,
        }
    }

    pub fn model(&self) -> &QueryModel {
        &self.plan.model
    }

    pub fn tables(&self) -> &[ShardTable] {
        &self.plan.route.tables
    }
}

/// Row sequence of a row-shaped strategy.
pub struct RowSequence {
    ctx: StrategyContext,
    strategy: ExecutionStrategy,
}

impl RowSequence {
    pub fn new(ctx: StrategyContext, strategy: ExecutionStrategy) -> Self {
        Self { ctx, strategy }
    }
}

#[async_trait]
impl Sequence for RowSequence {
    type Item = OwnedRow;

    async fn open(&self, cancel: CancelToken) -> ShardexResult<BoxCursor<OwnedRow>> {
        cancel.check()?;
        match &self.strategy {
            ExecutionStrategy::Ordinary => ordinary::open(&self.ctx, cancel).await,
            ExecutionStrategy::OrderedMerge => ordered::open(&self.ctx, cancel, None).await,
            ExecutionStrategy::SortedMerge => merge::open(&self.ctx, cancel).await,
            ExecutionStrategy::Grouped => grouped::open(&self.ctx, cancel).await,
            other => Err(ShardexError::internal_bug(
                "E-STRATEGY-002",
                "row sequence opened for a non-row strategy",
                format!("strategy={}", other.name()),
            )),
        }
    }
}

/// Global skip/take/distinct applied at the coordinator.
pub(crate) struct Window {
    skip: u64,
    remaining: Option<u64>,
    seen: Option<HashSet<Vec<u8>>>,
}

impl Window {
    pub(crate) fn new(skip: u64, take: Option<u64>, distinct: bool) -> Self {
        Self {
            skip,
            remaining: take,
            seen: distinct.then(HashSet::new),
        }
    }

    pub(crate) fn for_model(model: &QueryModel) -> Self {
        Self::new(model.skip, model.take, model.distinct)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Rows one more shard must return for the window to still be fillable.
    /// Unbounded under distinct, where duplicates shrink what a shard yields.
    pub(crate) fn shard_limit(&self) -> Option<u64> {
        if self.seen.is_some() {
            return None;
        }
        self.remaining.map(|r| r.saturating_add(self.skip))
    }

    /// Feed one row; returns it when it lands inside the window.
    pub(crate) fn admit(&mut self, row: OwnedRow) -> Option<OwnedRow> {
        if self.is_full() {
            return None;
        }
        if let Some(seen) = &mut self.seen {
            if !seen.insert(row.encode_key(None)) {
                return None;
            }
        }
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }
        if let Some(r) = &mut self.remaining {
            *r -= 1;
        }
        Some(row)
    }

    pub(crate) fn apply(mut self, rows: impl IntoIterator<Item = OwnedRow>) -> Vec<OwnedRow> {
        let mut out = Vec::new();
        for row in rows {
            if self.is_full() {
                break;
            }
            if let Some(row) = self.admit(row) {
                out.push(row);
            }
        }
        out
    }
}

/// Resolved ordering: column index into the result set plus direction.
pub(crate) type SortColumns = Vec<(usize, SortDirection)>;

pub(crate) fn resolve_sort_columns(columns: &[String], ordering: &[OrderKey]) -> ShardexResult<SortColumns> {
    ordering
        .iter()
        .map(|key| {
            columns
                .iter()
                .position(|c| *c == key.column)
                .map(|idx| (idx, key.direction))
                .ok_or_else(|| ShardexError::from(PlanError::OrderColumnNotProjected(key.column.clone())))
        })
        .collect()
}

pub(crate) fn compare_rows(a: &OwnedRow, b: &OwnedRow, sort_columns: &[(usize, SortDirection)]) -> Ordering {
    for &(idx, direction) in sort_columns {
        let ord = match (a.get(idx), b.get(idx)) {
            (Some(x), Some(y)) => x.cmp(y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = if direction.is_descending() { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// In-flight shard statements, each tagged with its position in the route.
pub(crate) type ShardFutures<T> =
    FuturesUnordered<BoxFuture<'static, ShardexResult<(usize, PartialResult<T>)>>>;

pub(crate) fn dispatch_rows(
    ctx: &StrategyContext,
    query: &ShardQuery,
    cancel: &CancelToken,
) -> ShardFutures<ShardRows> {
    ctx.tables()
        .iter()
        .enumerate()
        .map(|(idx, table)| {
            let executor = Arc::clone(&ctx.executor);
            let query = query.clone();
            let table = table.clone();
            let cancel = cancel.clone();
            async move {
                let partial = executor.query_rows(&query, &table, &cancel).await?;
                Ok((idx, partial))
            }
            .boxed()
        })
        .collect()
}

pub(crate) fn dispatch_aggregates(
    ctx: &StrategyContext,
    query: &ShardQuery,
    cancel: &CancelToken,
) -> ShardFutures<PartialAggregate> {
    ctx.tables()
        .iter()
        .enumerate()
        .map(|(idx, table)| {
            let executor = Arc::clone(&ctx.executor);
            let query = query.clone();
            let table = table.clone();
            let cancel = cancel.clone();
            async move {
                let partial = executor
                    .query_partial_aggregate(&query, &table, &cancel)
                    .await?;
                Ok((idx, partial))
            }
            .boxed()
        })
        .collect()
}

/// Await every shard, failing fast: the first error drops the remaining
/// futures, which aborts their statements and returns their connections.
/// Results come back in route order.
pub(crate) async fn gather_all<T>(mut pending: ShardFutures<T>) -> ShardexResult<Vec<PartialResult<T>>> {
    let mut results = Vec::with_capacity(pending.len());
    while let Some(next) = pending.next().await {
        match next {
            Ok(result) => results.push(result),
            Err(e) => {
                let aborted = pending.len();
                drop(pending);
                if aborted > 0 {
                    tracing::debug!(aborted, error = %e, "aborting sibling shard statements");
                }
                return Err(e);
            }
        }
    }
    results.sort_by_key(|(idx, _)| *idx);
    Ok(results.into_iter().map(|(_, r)| r).collect())
}
