//! Shard routing contract: logical table + predicate -> physical shard tables.

use std::collections::HashMap;

use async_trait::async_trait;

use shardex_common::{ShardTable, ShardexError, ShardexResult, SortDirection};

use crate::plan::Predicate;

/// Resolved shard list for one logical table.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub tables: Vec<ShardTable>,
    /// Tables are value-range partitioned on `order_column`, each internally
    /// ordered, with disjoint ranges.
    pub ordered: bool,
    pub order_column: Option<String>,
}

impl RouteResult {
    pub fn unordered(tables: Vec<ShardTable>) -> Self {
        Self {
            tables,
            ordered: false,
            order_column: None,
        }
    }

    pub fn ordered(tables: Vec<ShardTable>, order_column: impl Into<String>) -> Self {
        Self {
            tables,
            ordered: true,
            order_column: Some(order_column.into()),
        }
    }

    /// An ordered route must name its column and carry a range on every table.
    pub fn validate(&self) -> ShardexResult<()> {
        if !self.ordered {
            return Ok(());
        }
        if self.order_column.is_none() {
            return Err(ShardexError::Routing(
                "ordered route without an order column".into(),
            ));
        }
        if let Some(t) = self.tables.iter().find(|t| t.range.is_none()) {
            return Err(ShardexError::Routing(format!(
                "ordered route table {} has no value range",
                t
            )));
        }
        Ok(())
    }
}

/// Maps a logical table to its physical shard tables.
#[async_trait]
pub trait ShardRouter: Send + Sync {
    async fn resolve(&self, logical_table: &str, predicate: &Predicate) -> ShardexResult<RouteResult>;
}

/// Router with a fixed route per logical table. Ignores the predicate.
#[derive(Debug, Default, Clone)]
pub struct StaticRouter {
    routes: HashMap<String, RouteResult>,
}

impl StaticRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, logical_table: impl Into<String>, route: RouteResult) -> Self {
        self.routes.insert(logical_table.into(), route);
        self
    }
}

#[async_trait]
impl ShardRouter for StaticRouter {
    async fn resolve(&self, logical_table: &str, _predicate: &Predicate) -> ShardexResult<RouteResult> {
        self.routes
            .get(logical_table)
            .cloned()
            .ok_or_else(|| ShardexError::Routing(format!("no route for table '{}'", logical_table)))
    }
}

/// Tables sorted by range start: ascending for `Ascending`, reversed for
/// `Descending`. Tables without a range keep their relative position at the end.
pub fn tables_in_range_order(tables: &[ShardTable], direction: SortDirection) -> Vec<ShardTable> {
    range_order(tables, direction)
        .into_iter()
        .map(|idx| tables[idx].clone())
        .collect()
}

/// Route positions of `tables` in range order. Two tables may share a name
/// on different data sources, so positions rather than names identify them.
pub fn range_order(tables: &[ShardTable], direction: SortDirection) -> Vec<usize> {
    let mut order: Vec<usize> = (0..tables.len()).collect();
    order.sort_by(|&a, &b| match (&tables[a].range, &tables[b].range) {
        (Some(ra), Some(rb)) => {
            let ord = ra.min.cmp(&rb.min);
            if direction.is_descending() {
                ord.reverse()
            } else {
                ord
            }
        }
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    order
}
