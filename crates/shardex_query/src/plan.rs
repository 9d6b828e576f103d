//! Query plan data model: the accumulated operator state and its frozen form.

use std::fmt;

use shardex_common::{Datum, ShardexError, ShardexResult, SortDirection};

use crate::routing::RouteResult;

/// One ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderKey {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Aggregate kinds the engine can scatter and recombine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Count,
    LongCount,
    Sum,
    Min,
    Max,
    Average,
}

/// One shard's contribution to an aggregate.
///
/// `count` is only meaningful for `Average`, where it carries the shard's
/// non-NULL row count alongside the partial sum in `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialAggregate {
    pub value: Datum,
    pub count: i64,
}

impl PartialAggregate {
    pub fn scalar(value: Datum) -> Self {
        Self { value, count: 0 }
    }
}

impl AggregateOp {
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Count => "Count",
            AggregateOp::LongCount => "LongCount",
            AggregateOp::Sum => "Sum",
            AggregateOp::Min => "Min",
            AggregateOp::Max => "Max",
            AggregateOp::Average => "Average",
        }
    }

    /// SQL function each shard evaluates. `Average` is split into SUM + COUNT.
    pub fn sql_function(self) -> &'static str {
        match self {
            AggregateOp::Count | AggregateOp::LongCount => "COUNT",
            AggregateOp::Sum | AggregateOp::Average => "SUM",
            AggregateOp::Min => "MIN",
            AggregateOp::Max => "MAX",
        }
    }

    /// Whether the aggregate needs a column argument.
    pub fn needs_column(self) -> bool {
        !matches!(self, AggregateOp::Count | AggregateOp::LongCount)
    }

    /// Merge two partial values of the same group. `Average` is not mergeable
    /// pairwise; use [`AggregateOp::combine`].
    pub fn merge(self, existing: &Datum, incoming: &Datum) -> Datum {
        match self {
            AggregateOp::Count | AggregateOp::LongCount | AggregateOp::Sum => existing.add(incoming),
            AggregateOp::Min => pick(existing, incoming, std::cmp::Ordering::Less),
            AggregateOp::Max => pick(existing, incoming, std::cmp::Ordering::Greater),
            AggregateOp::Average => existing.clone(),
        }
    }

    /// Combine per-shard partials into the final answer.
    ///
    /// Count/LongCount are summed as 64-bit. Sum ignores NULL partials and is
    /// NULL only when every shard returned NULL. Min/Max skip NULLs. Average is
    /// the weighted `Σsum / Σcount`, NULL when no shard had a row.
    pub fn combine(self, partials: &[PartialAggregate]) -> ShardexResult<Datum> {
        match self {
            AggregateOp::Count | AggregateOp::LongCount => {
                let mut total: i64 = 0;
                for p in partials {
                    let n = match &p.value {
                        Datum::Null => 0,
                        v => v.as_i64().ok_or_else(|| {
                            ShardexError::Internal(format!("non-integer count partial: {}", v))
                        })?,
                    };
                    total += n;
                }
                Ok(Datum::Int64(total))
            }
            AggregateOp::Sum | AggregateOp::Min | AggregateOp::Max => Ok(partials
                .iter()
                .fold(Datum::Null, |acc, p| self.merge(&acc, &p.value))),
            AggregateOp::Average => {
                let mut sum = 0.0f64;
                let mut count: i64 = 0;
                for p in partials {
                    if p.count == 0 {
                        continue;
                    }
                    let v = p.value.as_f64().ok_or_else(|| {
                        ShardexError::Internal(format!("non-numeric average partial: {}", p.value))
                    })?;
                    sum += v;
                    count += p.count;
                }
                if count == 0 {
                    Ok(Datum::Null)
                } else {
                    Ok(Datum::Float64(sum / count as f64))
                }
            }
        }
    }
}

fn pick(existing: &Datum, incoming: &Datum, wanted: std::cmp::Ordering) -> Datum {
    match (existing, incoming) {
        (Datum::Null, other) | (other, Datum::Null) => other.clone(),
        (a, b) if b.cmp(a) == wanted => b.clone(),
        (a, _) => a.clone(),
    }
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A scalar aggregate requested by a terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub op: AggregateOp,
    pub column: Option<String>,
}

impl AggregateSpec {
    pub fn new(op: AggregateOp, column: Option<&str>) -> Self {
        Self {
            op,
            column: column.map(str::to_string),
        }
    }
}

/// One conjunct of the predicate, already in the compiler's SQL dialect.
/// The engine never looks inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub sql: String,
    pub params: Vec<Datum>,
}

impl Filter {
    pub fn new(sql: impl Into<String>, params: Vec<Datum>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Conjunction of filters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub conjuncts: Vec<Filter>,
}

impl Predicate {
    pub fn and(&mut self, filter: Filter) {
        self.conjuncts.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.conjuncts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "=" => CompareOp::Eq,
            "<>" | "!=" => CompareOp::NotEq,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::LtEq,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::GtEq,
            _ => return None,
        })
    }

    /// SQL comparison semantics: anything compared with NULL is false.
    pub fn evaluate(self, left: &Datum, right: &Datum) -> bool {
        if left.is_null() || right.is_null() {
            return false;
        }
        let ord = left.cmp(right);
        match self {
            CompareOp::Eq => ord.is_eq(),
            CompareOp::NotEq => ord.is_ne(),
            CompareOp::Lt => ord.is_lt(),
            CompareOp::LtEq => ord.is_le(),
            CompareOp::Gt => ord.is_gt(),
            CompareOp::GtEq => ord.is_ge(),
        }
    }
}

/// Post-grouping filter, evaluated at the coordinator on merged groups.
#[derive(Debug, Clone, PartialEq)]
pub struct HavingFilter {
    pub column: String,
    pub op: CompareOp,
    pub value: Datum,
}

impl HavingFilter {
    pub fn new(column: impl Into<String>, op: CompareOp, value: impl Into<Datum>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// One output column of an explicit projection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectedColumn {
    Column(String),
    Aggregate {
        op: AggregateOp,
        column: Option<String>,
        alias: String,
    },
}

impl ProjectedColumn {
    pub fn column(name: impl Into<String>) -> Self {
        ProjectedColumn::Column(name.into())
    }

    pub fn aggregate(op: AggregateOp, column: Option<&str>, alias: impl Into<String>) -> Self {
        ProjectedColumn::Aggregate {
            op,
            column: column.map(str::to_string),
            alias: alias.into(),
        }
    }

    /// Name of the column in the result set.
    pub fn output_name(&self) -> &str {
        match self {
            ProjectedColumn::Column(name) => name,
            ProjectedColumn::Aggregate { alias, .. } => alias,
        }
    }
}

/// Operators folded in so far. Mutated only by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryModel {
    pub logical_table: String,
    pub predicate: Predicate,
    pub ordering: Vec<OrderKey>,
    pub skip: u64,
    pub take: Option<u64>,
    pub distinct: bool,
    pub group_by: Vec<String>,
    pub having: Vec<HavingFilter>,
    /// Empty means "all columns".
    pub projection: Vec<ProjectedColumn>,
    pub aggregate: Option<AggregateSpec>,
    pub ignore_filters: bool,
}

impl QueryModel {
    pub fn new(logical_table: impl Into<String>) -> Self {
        Self {
            logical_table: logical_table.into(),
            predicate: Predicate::default(),
            ordering: Vec::new(),
            skip: 0,
            take: None,
            distinct: false,
            group_by: Vec::new(),
            having: Vec::new(),
            projection: Vec::new(),
            aggregate: None,
            ignore_filters: false,
        }
    }

    pub fn has_window(&self) -> bool {
        self.skip > 0 || self.take.is_some()
    }

    /// Rows each shard must return so that the global window can be cut at the
    /// coordinator: `skip + take`, or everything when no take is set. Distinct
    /// plans fetch everything, since duplicates across shards shrink the window.
    pub fn fetch_limit(&self) -> Option<u64> {
        if self.distinct {
            return None;
        }
        self.take.map(|t| self.skip.saturating_add(t))
    }
}

/// A frozen model plus its resolved route. Immutable once built.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub model: QueryModel,
    pub route: RouteResult,
}

impl QueryPlan {
    pub fn new(model: QueryModel, route: RouteResult) -> Self {
        Self { model, route }
    }

    /// True when the route is value-range ordered on the plan's primary
    /// ordering column, so shards can be walked in range order.
    pub fn is_ordered_tables(&self) -> bool {
        match (self.route.ordered, self.model.ordering.first(), &self.route.order_column) {
            (true, Some(key), Some(column)) => key.column == *column,
            _ => false,
        }
    }

    pub fn primary_direction(&self) -> SortDirection {
        self.model
            .ordering
            .first()
            .map(|k| k.direction)
            .unwrap_or(SortDirection::Ascending)
    }
}
