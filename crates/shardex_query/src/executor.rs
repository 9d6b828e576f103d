//! Per-shard executor: compile, check out a pooled connection, run, release.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use shardex_common::{
    CancelToken, Datum, OwnedRow, PoolConfig, PoolError, ShardTable, ShardexError, ShardexResult,
};

use crate::compiler::{QueryShape, ShardQuery, SqlCompiler, Statement};
use crate::plan::{AggregateOp, PartialAggregate};
use crate::pool::{PoolStats, ResourcePool};

/// Rows returned by one shard statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardRows {
    pub columns: Vec<String>,
    pub rows: Vec<OwnedRow>,
}

impl ShardRows {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// One shard's outcome, tagged with the originating table.
#[derive(Debug, Clone)]
pub struct PartialResult<T> {
    pub table: ShardTable,
    pub value: T,
    pub latency_us: u64,
}

/// Transport to one physical store. One instance is used by one task at a time.
#[async_trait]
pub trait ShardConnection: Send {
    async fn query_rows(&mut self, table: &ShardTable, statement: &Statement) -> ShardexResult<ShardRows>;

    async fn query_scalar(&mut self, table: &ShardTable, statement: &Statement) -> ShardexResult<Datum>;
}

/// Opens connections to the physical stores.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn data_sources(&self) -> Vec<String>;

    async fn connect(&self, data_source: &str) -> ShardexResult<Box<dyn ShardConnection>>;
}

type ConnectionPool = ResourcePool<Box<dyn ShardConnection>>;

/// Executes compiled shard statements under per-store connection pools.
pub struct ShardExecutor {
    compiler: Arc<dyn SqlCompiler>,
    pools: HashMap<String, ConnectionPool>,
}

impl ShardExecutor {
    pub fn new(compiler: Arc<dyn SqlCompiler>) -> Self {
        Self {
            compiler,
            pools: HashMap::new(),
        }
    }

    /// Register a pool over `connections` for `data_source`. Its size caps the
    /// number of shard statements running against that store at once.
    pub fn with_data_source(
        mut self,
        data_source: impl Into<String>,
        connections: Vec<Box<dyn ShardConnection>>,
    ) -> Self {
        let name = data_source.into();
        self.pools
            .insert(name.clone(), ResourcePool::new(name, connections));
        self
    }

    /// Open `max_connections_per_source` connections to every store the factory knows.
    pub async fn connect(
        compiler: Arc<dyn SqlCompiler>,
        factory: &dyn ConnectionFactory,
        config: &PoolConfig,
    ) -> ShardexResult<Self> {
        let mut executor = Self::new(compiler);
        for ds in factory.data_sources() {
            let mut connections = Vec::with_capacity(config.max_connections_per_source);
            for _ in 0..config.max_connections_per_source {
                connections.push(factory.connect(&ds).await?);
            }
            tracing::debug!(data_source = %ds, size = connections.len(), "opened connection pool");
            executor = executor.with_data_source(ds, connections);
        }
        Ok(executor)
    }

    fn pool(&self, data_source: &str) -> ShardexResult<&ConnectionPool> {
        self.pools
            .get(data_source)
            .ok_or_else(|| PoolError::UnknownDataSource(data_source.to_string()).into())
    }

    pub fn pool_stats(&self, data_source: &str) -> Option<PoolStats> {
        self.pools.get(data_source).map(|p| p.stats())
    }

    /// Run a row-shaped statement on one shard.
    pub async fn query_rows(
        &self,
        query: &ShardQuery,
        table: &ShardTable,
        cancel: &CancelToken,
    ) -> ShardexResult<PartialResult<ShardRows>> {
        let statement = self.compiler.compile(query, table)?;
        let pool = self.pool(&table.data_source)?;
        let start = Instant::now();
        let result = async {
            let mut conn = pool.acquire(cancel).await?;
            cancel.guard(conn.query_rows(table, &statement)).await
        }
        .await
        .map_err(|e| e.tag_shard(table));
        let latency_us = start.elapsed().as_micros() as u64;
        finish("rows", table, &statement, latency_us, result)
    }

    /// Run a scalar statement on one shard.
    pub async fn query_scalar(
        &self,
        query: &ShardQuery,
        table: &ShardTable,
        cancel: &CancelToken,
    ) -> ShardexResult<PartialResult<Datum>> {
        let statement = self.compiler.compile(query, table)?;
        let pool = self.pool(&table.data_source)?;
        let start = Instant::now();
        let result = async {
            let mut conn = pool.acquire(cancel).await?;
            cancel.guard(conn.query_scalar(table, &statement)).await
        }
        .await
        .map_err(|e| e.tag_shard(table));
        let latency_us = start.elapsed().as_micros() as u64;
        finish("scalar", table, &statement, latency_us, result)
    }

    /// Per-shard partial of an aggregate. `Average` runs SUM then COUNT on the
    /// same checked-out connection so both see one snapshot of the shard.
    pub async fn query_partial_aggregate(
        &self,
        query: &ShardQuery,
        table: &ShardTable,
        cancel: &CancelToken,
    ) -> ShardexResult<PartialResult<PartialAggregate>> {
        let (op, column) = match &query.shape {
            QueryShape::Aggregate(op, column) => (*op, column.clone()),
            QueryShape::Rows => {
                return Err(ShardexError::internal_bug(
                    "E-EXEC-001",
                    "partial aggregate requested for a row-shaped query",
                    format!("table={}", table),
                ))
            }
        };
        if op != AggregateOp::Average {
            let partial = self.query_scalar(query, table, cancel).await?;
            return Ok(PartialResult {
                table: partial.table,
                value: PartialAggregate::scalar(partial.value),
                latency_us: partial.latency_us,
            });
        }

        let sum_stmt = self.compiler.compile(query, table)?;
        let count_query = ShardQuery::aggregate(query.plan.clone(), AggregateOp::Count, column);
        let count_stmt = self.compiler.compile(&count_query, table)?;
        let pool = self.pool(&table.data_source)?;
        let start = Instant::now();
        let result = async {
            let mut conn = pool.acquire(cancel).await?;
            let sum = cancel.guard(conn.query_scalar(table, &sum_stmt)).await?;
            let count = cancel.guard(conn.query_scalar(table, &count_stmt)).await?;
            let count = match count {
                Datum::Null => 0,
                other => other.as_i64().ok_or_else(|| {
                    ShardexError::Internal(format!("non-integer count: {}", other))
                })?,
            };
            Ok(PartialAggregate { value: sum, count })
        }
        .await
        .map_err(|e: ShardexError| e.tag_shard(table));
        let latency_us = start.elapsed().as_micros() as u64;
        finish("aggregate", table, &sum_stmt, latency_us, result)
    }

    /// Dispose every pool. Pending checkouts fail with a pool-closed error.
    pub fn dispose(&self) {
        for pool in self.pools.values() {
            pool.dispose();
        }
    }
}

fn finish<T>(
    kind: &'static str,
    table: &ShardTable,
    statement: &Statement,
    latency_us: u64,
    result: ShardexResult<T>,
) -> ShardexResult<PartialResult<T>> {
    shardex_observability::record_shard_query(kind, latency_us, result.is_ok());
    match result {
        Ok(value) => {
            tracing::debug!(shard = %table, sql = %statement.sql, latency_us, "shard statement done");
            Ok(PartialResult {
                table: table.clone(),
                value,
                latency_us,
            })
        }
        Err(e) => {
            if !e.is_cancelled() {
                tracing::warn!(shard = %table, error = %e, "shard statement failed");
            }
            Err(e)
        }
    }
}
