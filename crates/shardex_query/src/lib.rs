//! Sharded query planning and scatter/gather execution.
//!
//! A [`ShardingQuery`] folds fluent operators into a plan through the
//! [`state`] machine. A terminal freezes the plan, resolves its shard tables
//! through a [`ShardRouter`], and runs the [`ExecutionStrategy`] matching the
//! plan's shape. Per-shard statements go through the [`ShardExecutor`], whose
//! per-store [`ResourcePool`]s bound how many run at once.

pub mod compiler;
pub mod executor;
pub mod plan;
pub mod pool;
pub mod query;
pub mod routing;
pub mod sequence;
pub mod state;
pub mod strategy;

pub use compiler::{QueryShape, ShardQuery, SqlCompiler, Statement};
pub use executor::{ConnectionFactory, PartialResult, ShardConnection, ShardExecutor, ShardRows};
pub use plan::{
    AggregateOp, AggregateSpec, CompareOp, Filter, HavingFilter, OrderKey, PartialAggregate,
    Predicate, ProjectedColumn, QueryModel, QueryPlan,
};
pub use pool::{PoolStats, Pooled, ResourcePool};
pub use query::{ShardingContext, ShardingQuery};
pub use routing::{range_order, tables_in_range_order, RouteResult, ShardRouter, StaticRouter};
pub use sequence::{BlockingIter, BoxCursor, Cursor, Sequence};
pub use state::{QueryOp, QueryState, StateKind};
pub use strategy::{ExecutionStrategy, PagingData, PagingResult, Terminal};
