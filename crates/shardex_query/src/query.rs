//! Query-building façade.
//!
//! # Usage
//! ```ignore
//! let ctx = ShardingContext::new(router, executor, ShardingConfig::default());
//! let page = ctx
//!     .query("orders")
//!     .filter("amount > ?", vec![Datum::Int64(100)])?
//!     .order_by("id")?
//!     .paging(3, 20, &CancelToken::new())
//!     .await?;
//! println!("{} of {}", page.data_list.len(), page.totals);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shardex_common::{
    CancelToken, Datum, OwnedRow, PlanError, ShardexError, ShardexResult, ShardingConfig,
};

use crate::executor::ShardExecutor;
use crate::plan::{
    AggregateOp, AggregateSpec, Filter, HavingFilter, OrderKey, ProjectedColumn, QueryPlan,
};
use crate::routing::ShardRouter;
use crate::sequence::{block_on, collect, first, BlockingIter, BoxCursor, Sequence};
use crate::state::{QueryOp, QueryState};
use crate::strategy::{
    AggregateSequence, ExecutionStrategy, PagingResult, PagingSequence, RowSequence,
    StrategyContext, Terminal,
};

/// Entry point: owns the router, the executor and the engine configuration.
#[derive(Clone)]
pub struct ShardingContext {
    router: Arc<dyn ShardRouter>,
    executor: Arc<ShardExecutor>,
    config: Arc<ShardingConfig>,
    global_filters: Arc<HashMap<String, Vec<Filter>>>,
}

impl ShardingContext {
    pub fn new(router: Arc<dyn ShardRouter>, executor: Arc<ShardExecutor>, config: ShardingConfig) -> Self {
        Self {
            router,
            executor,
            config: Arc::new(config),
            global_filters: Arc::new(HashMap::new()),
        }
    }

    /// Register a filter conjuncted into every query on `logical_table`
    /// unless the query calls `ignore_all_filters`.
    pub fn with_global_filter(mut self, logical_table: impl Into<String>, filter: Filter) -> Self {
        Arc::make_mut(&mut self.global_filters)
            .entry(logical_table.into())
            .or_default()
            .push(filter);
        self
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<ShardExecutor> {
        &self.executor
    }

    pub fn query(&self, logical_table: impl Into<String>) -> ShardingQuery {
        ShardingQuery {
            ctx: self.clone(),
            state: QueryState::new(logical_table),
        }
    }

    /// Dispose every connection pool. Queries still waiting fail with a pool-closed error.
    pub fn dispose(&self) {
        self.executor.dispose();
    }
}

/// A fluent query over one logical table. Builders consume and return the
/// query; illegal operator sequences fail right there, before any shard is
/// contacted.
#[derive(Clone)]
pub struct ShardingQuery {
    ctx: ShardingContext,
    state: QueryState,
}

impl ShardingQuery {
    fn apply(self, op: QueryOp) -> ShardexResult<Self> {
        Ok(Self {
            state: self.state.accept(op)?,
            ctx: self.ctx,
        })
    }

    pub fn filter(self, sql: impl Into<String>, params: Vec<Datum>) -> ShardexResult<Self> {
        self.apply(QueryOp::Where(Filter::new(sql, params)))
    }

    pub fn take(self, n: i64) -> ShardexResult<Self> {
        self.apply(QueryOp::Take(n))
    }

    pub fn skip(self, n: i64) -> ShardexResult<Self> {
        self.apply(QueryOp::Skip(n))
    }

    /// 1-based page of `size` rows.
    pub fn page(self, page: i64, size: i64) -> ShardexResult<Self> {
        self.apply(QueryOp::Paging { page, size })
    }

    pub fn order_by(self, column: &str) -> ShardexResult<Self> {
        self.apply(QueryOp::OrderBy(OrderKey::asc(column)))
    }

    pub fn order_by_desc(self, column: &str) -> ShardexResult<Self> {
        self.apply(QueryOp::OrderBy(OrderKey::desc(column)))
    }

    pub fn then_by(self, column: &str) -> ShardexResult<Self> {
        self.apply(QueryOp::ThenBy(OrderKey::asc(column)))
    }

    pub fn then_by_desc(self, column: &str) -> ShardexResult<Self> {
        self.apply(QueryOp::ThenBy(OrderKey::desc(column)))
    }

    pub fn distinct(self) -> ShardexResult<Self> {
        self.apply(QueryOp::Distinct)
    }

    pub fn group_by(self, columns: &[&str]) -> ShardexResult<Self> {
        self.apply(QueryOp::GroupBy(columns.iter().map(|c| c.to_string()).collect()))
    }

    pub fn having(self, filter: HavingFilter) -> ShardexResult<Self> {
        self.apply(QueryOp::Having(filter))
    }

    pub fn select(self, columns: Vec<ProjectedColumn>) -> ShardexResult<Self> {
        self.apply(QueryOp::Select(columns))
    }

    pub fn ignore_all_filters(self) -> ShardexResult<Self> {
        self.apply(QueryOp::IgnoreAllFilters)
    }

    /// Freeze `state`, resolve its route and pick a strategy.
    async fn freeze(
        &self,
        state: QueryState,
        terminal: Terminal,
    ) -> ShardexResult<(StrategyContext, ExecutionStrategy)> {
        let mut model = state.freeze()?;
        if !model.ignore_filters {
            if let Some(filters) = self.ctx.global_filters.get(&model.logical_table) {
                for filter in filters {
                    model.predicate.and(filter.clone());
                }
            }
        }
        let route = self
            .ctx
            .router
            .resolve(&model.logical_table, &model.predicate)
            .await?;
        route.validate()?;
        let plan = Arc::new(QueryPlan::new(model, route));
        let strategy = ExecutionStrategy::select(&plan, terminal)?;
        tracing::debug!(
            table = %plan.model.logical_table,
            shards = plan.route.tables.len(),
            strategy = strategy.name(),
            "plan frozen"
        );
        let ctx = StrategyContext::new(
            Arc::clone(&self.ctx.executor),
            plan,
            self.ctx.config.execution.clone(),
        );
        Ok((ctx, strategy))
    }

    /// Apply the configured default timeout when the caller's token has no deadline.
    async fn bounded<T>(
        &self,
        cancel: &CancelToken,
        fut: impl Future<Output = ShardexResult<T>>,
    ) -> ShardexResult<T> {
        let timeout_ms = self.ctx.config.execution.default_timeout_ms;
        if timeout_ms == 0 || cancel.deadline().is_some() {
            return fut.await;
        }
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| ShardexError::DeadlineExceeded)?
    }

    async fn row_sequence(&self, state: QueryState) -> ShardexResult<RowSequence> {
        let (ctx, strategy) = self.freeze(state, Terminal::Rows).await?;
        Ok(RowSequence::new(ctx, strategy))
    }

    /// The frozen plan this query would execute.
    pub async fn plan(&self) -> ShardexResult<Arc<QueryPlan>> {
        let (ctx, _) = self.freeze(self.state.clone(), Terminal::Rows).await?;
        Ok(ctx.plan)
    }

    /// The strategy the rows terminal would run.
    pub async fn strategy(&self) -> ShardexResult<ExecutionStrategy> {
        let (_, strategy) = self.freeze(self.state.clone(), Terminal::Rows).await?;
        Ok(strategy)
    }

    /// Open a row cursor, positioned at the first row.
    pub async fn rows(&self, cancel: &CancelToken) -> ShardexResult<BoxCursor<OwnedRow>> {
        self.bounded(cancel, async {
            let seq = self.row_sequence(self.state.clone()).await?;
            seq.open(cancel.clone()).await
        })
        .await
    }

    pub fn rows_blocking(&self, cancel: &CancelToken) -> ShardexResult<BlockingIter<OwnedRow>> {
        let seq = block_on(self.row_sequence(self.state.clone()))?;
        BlockingIter::open(&seq, cancel.clone())
    }

    pub async fn to_list(&self, cancel: &CancelToken) -> ShardexResult<Vec<OwnedRow>> {
        self.bounded(cancel, async {
            let seq = self.row_sequence(self.state.clone()).await?;
            collect(&seq, cancel.clone()).await
        })
        .await
    }

    pub fn to_list_blocking(&self, cancel: &CancelToken) -> ShardexResult<Vec<OwnedRow>> {
        block_on(self.to_list(cancel))
    }

    pub async fn first(&self, cancel: &CancelToken) -> ShardexResult<Option<OwnedRow>> {
        self.bounded(cancel, async {
            let state = self.state.clone().accept(QueryOp::Take(1))?;
            let seq = self.row_sequence(state).await?;
            first(&seq, cancel.clone()).await
        })
        .await
    }

    pub fn first_blocking(&self, cancel: &CancelToken) -> ShardexResult<Option<OwnedRow>> {
        block_on(self.first(cancel))
    }

    pub async fn any(&self, cancel: &CancelToken) -> ShardexResult<bool> {
        Ok(self.first(cancel).await?.is_some())
    }

    pub fn any_blocking(&self, cancel: &CancelToken) -> ShardexResult<bool> {
        block_on(self.any(cancel))
    }

    async fn aggregate(&self, op: AggregateOp, column: Option<&str>, cancel: &CancelToken) -> ShardexResult<Datum> {
        self.bounded(cancel, async {
            let spec = AggregateSpec::new(op, column);
            let state = self.state.clone().accept(QueryOp::Aggregate(spec.clone()))?;
            let (ctx, _) = self.freeze(state, Terminal::Scalar).await?;
            let seq = AggregateSequence::new(ctx, spec);
            Ok(first(&seq, cancel.clone()).await?.unwrap_or(Datum::Null))
        })
        .await
    }

    pub async fn count(&self, cancel: &CancelToken) -> ShardexResult<i32> {
        narrow_count(self.long_count(cancel).await?)
    }

    pub fn count_blocking(&self, cancel: &CancelToken) -> ShardexResult<i32> {
        block_on(self.count(cancel))
    }

    pub async fn long_count(&self, cancel: &CancelToken) -> ShardexResult<i64> {
        let value = self.aggregate(AggregateOp::LongCount, None, cancel).await?;
        count_value(&value)
    }

    pub fn long_count_blocking(&self, cancel: &CancelToken) -> ShardexResult<i64> {
        block_on(self.long_count(cancel))
    }

    pub async fn sum(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        self.aggregate(AggregateOp::Sum, Some(column), cancel).await
    }

    pub fn sum_blocking(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        block_on(self.sum(column, cancel))
    }

    pub async fn min(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        self.aggregate(AggregateOp::Min, Some(column), cancel).await
    }

    pub fn min_blocking(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        block_on(self.min(column, cancel))
    }

    pub async fn max(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        self.aggregate(AggregateOp::Max, Some(column), cancel).await
    }

    pub fn max_blocking(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Datum> {
        block_on(self.max(column, cancel))
    }

    /// Weighted average across shards; `None` when no row matched.
    pub async fn average(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Option<f64>> {
        let value = self.aggregate(AggregateOp::Average, Some(column), cancel).await?;
        Ok(value.as_f64())
    }

    pub fn average_blocking(&self, column: &str, cancel: &CancelToken) -> ShardexResult<Option<f64>> {
        block_on(self.average(column, cancel))
    }

    /// Total matching rows plus the rows of the current Skip/Take window.
    pub async fn to_paging_result(&self, cancel: &CancelToken) -> ShardexResult<PagingResult> {
        self.paging_with(self.state.clone(), cancel).await
    }

    pub fn to_paging_result_blocking(&self, cancel: &CancelToken) -> ShardexResult<PagingResult> {
        block_on(self.to_paging_result(cancel))
    }

    /// 1-based page of `size` rows with the total count.
    pub async fn paging(&self, page: i64, size: i64, cancel: &CancelToken) -> ShardexResult<PagingResult> {
        let state = self.state.clone().accept(QueryOp::Paging { page, size })?;
        self.paging_with(state, cancel).await
    }

    pub fn paging_blocking(&self, page: i64, size: i64, cancel: &CancelToken) -> ShardexResult<PagingResult> {
        block_on(self.paging(page, size, cancel))
    }

    async fn paging_with(&self, state: QueryState, cancel: &CancelToken) -> ShardexResult<PagingResult> {
        self.bounded(cancel, async {
            let (ctx, strategy) = self.freeze(state, Terminal::Paging).await?;
            let data = match &strategy {
                ExecutionStrategy::Paging(data) => *data,
                other => {
                    return Err(ShardexError::internal_bug(
                        "E-QUERY-001",
                        "paging terminal selected a non-paging strategy",
                        format!("strategy={}", other.name()),
                    ))
                }
            };
            let seq = PagingSequence::new(ctx, data);
            first(&seq, cancel.clone()).await?.ok_or_else(|| {
                ShardexError::internal_bug("E-QUERY-002", "paging sequence produced no result", "")
            })
        })
        .await
    }
}

/// A combined count: NULL (no shards) is 0, anything non-integer is a bug.
fn count_value(value: &Datum) -> ShardexResult<i64> {
    match value {
        Datum::Null => Ok(0),
        v => v.as_i64().ok_or_else(|| {
            ShardexError::internal_bug(
                "E-QUERY-003",
                "combined count is not an integer",
                format!("value={}", v),
            )
        }),
    }
}

fn narrow_count(n: i64) -> ShardexResult<i32> {
    i32::try_from(n).map_err(|_| PlanError::CountOverflow(n).into())
}
