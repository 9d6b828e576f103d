//! Incremental plan building: each fluent operator is one state transition.
//!
//! Narrowing operators (Where, Take, Skip, ThenBy) mutate the model in place;
//! shape-changing operators (OrderBy, Distinct, GroupBy, Aggregate) also move
//! the state to a later [`StateKind`]. Every rejection happens here, before
//! any shard is contacted.

use shardex_common::{PlanError, ShardexResult};

use crate::plan::{
    AggregateOp, AggregateSpec, Filter, HavingFilter, OrderKey, ProjectedColumn, QueryModel,
};

/// One fluent operator.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOp {
    Where(Filter),
    Take(i64),
    Skip(i64),
    /// 1-based page index and page size.
    Paging { page: i64, size: i64 },
    OrderBy(OrderKey),
    ThenBy(OrderKey),
    Distinct,
    GroupBy(Vec<String>),
    Having(HavingFilter),
    Select(Vec<ProjectedColumn>),
    Aggregate(AggregateSpec),
    IgnoreAllFilters,
}

impl QueryOp {
    fn name(&self) -> &'static str {
        match self {
            QueryOp::Where(_) => "Where",
            QueryOp::Take(_) => "Take",
            QueryOp::Skip(_) => "Skip",
            QueryOp::Paging { .. } => "Paging",
            QueryOp::OrderBy(_) => "OrderBy",
            QueryOp::ThenBy(_) => "ThenBy",
            QueryOp::Distinct => "Distinct",
            QueryOp::GroupBy(_) => "GroupBy",
            QueryOp::Having(_) => "Having",
            QueryOp::Select(_) => "Select",
            QueryOp::Aggregate(_) => "Aggregate",
            QueryOp::IgnoreAllFilters => "IgnoreAllFilters",
        }
    }
}

/// Execution shape reached so far. Later kinds dominate earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StateKind {
    Root,
    Ordered,
    Windowed,
    Distinct,
    Grouped,
    Aggregate,
}

#[derive(Debug, Clone)]
pub struct QueryState {
    kind: StateKind,
    model: QueryModel,
}

impl QueryState {
    pub fn new(logical_table: impl Into<String>) -> Self {
        Self {
            kind: StateKind::Root,
            model: QueryModel::new(logical_table),
        }
    }

    pub fn kind(&self) -> StateKind {
        self.kind
    }

    pub fn model(&self) -> &QueryModel {
        &self.model
    }

    fn promote(mut self, kind: StateKind) -> Self {
        self.kind = self.kind.max(kind);
        self
    }

    /// Fold one operator into the state.
    pub fn accept(mut self, op: QueryOp) -> ShardexResult<QueryState> {
        // Filters only narrow the input; they are legal after an aggregate too.
        let frozen = self.model.aggregate.is_some();
        if frozen && !matches!(op, QueryOp::Where(_) | QueryOp::IgnoreAllFilters) {
            return Err(PlanError::AggregateFrozen {
                operator: op.name(),
            }
            .into());
        }

        match op {
            QueryOp::Where(filter) => {
                self.model.predicate.and(filter);
                Ok(self)
            }
            QueryOp::Take(n) => {
                if n < 0 {
                    return Err(PlanError::NegativeTake(n).into());
                }
                let n = n as u64;
                self.model.take = Some(self.model.take.map_or(n, |t| t.min(n)));
                Ok(self.promote(StateKind::Windowed))
            }
            QueryOp::Skip(n) => {
                if n < 0 {
                    return Err(PlanError::NegativeSkip(n).into());
                }
                let n = n as u64;
                self.model.skip = self.model.skip.saturating_add(n);
                // The skip applies inside an already limited window.
                self.model.take = self.model.take.map(|t| t.saturating_sub(n));
                Ok(self.promote(StateKind::Windowed))
            }
            QueryOp::Paging { page, size } => {
                if page < 1 || size < 1 {
                    return Err(PlanError::InvalidPage { page, size }.into());
                }
                if self.model.distinct {
                    return Err(PlanError::Unsupported("paging a Distinct query".into()).into());
                }
                let skip = (page - 1).saturating_mul(size);
                self.accept(QueryOp::Skip(skip))?.accept(QueryOp::Take(size))
            }
            QueryOp::OrderBy(key) => {
                self.reject_after_window("OrderBy")?;
                self.model.ordering = vec![key];
                Ok(self.promote(StateKind::Ordered))
            }
            QueryOp::ThenBy(key) => {
                if self.model.ordering.is_empty() {
                    return Err(PlanError::ThenByWithoutOrderBy.into());
                }
                self.reject_after_window("ThenBy")?;
                self.model.ordering.push(key);
                Ok(self)
            }
            QueryOp::Distinct => {
                self.model.distinct = true;
                Ok(self.promote(StateKind::Distinct))
            }
            QueryOp::GroupBy(columns) => {
                self.reject_after_window("GroupBy")?;
                self.model.group_by.extend(columns);
                Ok(self.promote(StateKind::Grouped))
            }
            QueryOp::Having(filter) => {
                if self.model.group_by.is_empty() {
                    return Err(PlanError::HavingWithoutGroupBy.into());
                }
                self.model.having.push(filter);
                Ok(self)
            }
            QueryOp::Select(columns) => {
                self.model.projection = columns;
                Ok(self)
            }
            QueryOp::Aggregate(spec) => {
                if self.model.has_window() {
                    return Err(unsupported("an aggregate over a Skip/Take window"));
                }
                if self.model.distinct {
                    return Err(unsupported("an aggregate over a Distinct query"));
                }
                if !self.model.group_by.is_empty() {
                    return Err(unsupported("a scalar aggregate over a grouped query"));
                }
                if spec.op.needs_column() && spec.column.is_none() {
                    return Err(PlanError::Unsupported(format!("{} without a column", spec.op)).into());
                }
                // The result is scalar: row ordering no longer means anything.
                self.model.ordering.clear();
                self.model.aggregate = Some(spec);
                Ok(self.promote(StateKind::Aggregate))
            }
            QueryOp::IgnoreAllFilters => {
                self.model.ignore_filters = true;
                Ok(self)
            }
        }
    }

    fn reject_after_window(&self, operator: &str) -> ShardexResult<()> {
        if self.model.has_window() {
            return Err(PlanError::Unsupported(format!("{} after Skip/Take", operator)).into());
        }
        Ok(())
    }

    /// Plan freeze: final cross-operator checks, then hand out the model.
    pub fn freeze(self) -> ShardexResult<QueryModel> {
        let model = self.model;
        if !model.projection.is_empty() {
            for key in &model.ordering {
                if !model.projection.iter().any(|c| c.output_name() == key.column) {
                    return Err(PlanError::OrderColumnNotProjected(key.column.clone()).into());
                }
            }
        }
        if !model.group_by.is_empty() {
            let has_average = model.projection.iter().any(|c| {
                matches!(
                    c,
                    ProjectedColumn::Aggregate {
                        op: AggregateOp::Average,
                        ..
                    }
                )
            });
            if has_average {
                return Err(unsupported("Average inside a grouped projection"));
            }
        }
        Ok(model)
    }
}

fn unsupported(what: &str) -> shardex_common::ShardexError {
    PlanError::Unsupported(what.to_string()).into()
}
