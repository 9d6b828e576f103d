//! SQL compiler contract. The engine hands the compiler a plan fragment and a
//! shard table; the compiler owns the dialect.

use std::sync::Arc;

use shardex_common::{Datum, ShardTable, ShardexResult};

use crate::plan::{AggregateOp, QueryPlan};

/// Parameterized statement text for one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Datum>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Datum>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// What a shard statement returns.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    /// Rows: projection, ordering, grouping per the plan.
    Rows,
    /// One scalar: `op(column)` over the plan's predicate, ignoring ordering and window.
    Aggregate(AggregateOp, Option<String>),
}

/// The plan fragment to compile for one shard: the plan itself, the result
/// shape, and the shard-level window (which differs from the plan's global
/// window for every merge strategy).
#[derive(Debug, Clone)]
pub struct ShardQuery {
    pub plan: Arc<QueryPlan>,
    pub shape: QueryShape,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl ShardQuery {
    pub fn rows(plan: Arc<QueryPlan>, offset: u64, limit: Option<u64>) -> Self {
        Self {
            plan,
            shape: QueryShape::Rows,
            offset,
            limit,
        }
    }

    pub fn aggregate(plan: Arc<QueryPlan>, op: AggregateOp, column: Option<String>) -> Self {
        Self {
            plan,
            shape: QueryShape::Aggregate(op, column),
            offset: 0,
            limit: None,
        }
    }
}

pub trait SqlCompiler: Send + Sync {
    fn compile(&self, query: &ShardQuery, table: &ShardTable) -> ShardexResult<Statement>;
}
