//! In-memory sharded cluster for integration tests.
//!
//! `FixtureCompiler` renders plans into a small SQL subset; `MemoryConnection`
//! interprets exactly that subset against in-memory shard tables, recording
//! every statement and honouring injected failures and latency.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use shardex_common::{
    row, CancelToken, Datum, OwnedRow, ShardRange, ShardTable, ShardexError, ShardexResult,
    ShardingConfig,
};
use shardex_query::{
    CompareOp, ConnectionFactory, ProjectedColumn, QueryShape, RouteResult, ShardConnection,
    ShardExecutor, ShardQuery, ShardRows, ShardingContext, SqlCompiler, Statement, StaticRouter,
};

// ── Compiler ──

pub struct FixtureCompiler;

impl SqlCompiler for FixtureCompiler {
    fn compile(&self, query: &ShardQuery, table: &ShardTable) -> ShardexResult<Statement> {
        let model = &query.plan.model;
        let mut params = Vec::new();

        let select = match &query.shape {
            QueryShape::Aggregate(op, column) => format!(
                "{}({})",
                op.sql_function(),
                column.as_deref().unwrap_or("*")
            ),
            QueryShape::Rows if model.projection.is_empty() => "*".to_string(),
            QueryShape::Rows => model
                .projection
                .iter()
                .map(|c| match c {
                    ProjectedColumn::Column(name) => name.clone(),
                    ProjectedColumn::Aggregate { op, column, alias } => format!(
                        "{}({}) AS {}",
                        op.sql_function(),
                        column.as_deref().unwrap_or("*"),
                        alias
                    ),
                })
                .collect::<Vec<_>>()
                .join(", "),
        };
        let distinct = if model.distinct && query.shape == QueryShape::Rows {
            "DISTINCT "
        } else {
            ""
        };
        let mut sql = format!("SELECT {}{} FROM {}", distinct, select, table.name);

        if !model.predicate.is_empty() {
            let conjuncts: Vec<&str> = model.predicate.conjuncts.iter().map(|f| f.sql.as_str()).collect();
            sql.push_str(" WHERE ");
            sql.push_str(&conjuncts.join(" AND "));
            for f in &model.predicate.conjuncts {
                params.extend(f.params.iter().cloned());
            }
        }

        if query.shape == QueryShape::Rows {
            if !model.group_by.is_empty() {
                sql.push_str(" GROUP BY ");
                sql.push_str(&model.group_by.join(", "));
            }
            if !model.ordering.is_empty() {
                let keys: Vec<String> = model
                    .ordering
                    .iter()
                    .map(|k| format!("{} {}", k.column, k.direction.as_sql()))
                    .collect();
                sql.push_str(" ORDER BY ");
                sql.push_str(&keys.join(", "));
            }
            if let Some(limit) = query.limit {
                sql.push_str(" LIMIT ?");
                params.push(Datum::Int64(limit as i64));
            }
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                params.push(Datum::Int64(query.offset as i64));
            }
        }
        Ok(Statement::new(sql, params))
    }
}

// ── Statement interpreter ──

enum SelectItem {
    Star,
    Column(String),
    Aggregate {
        func: String,
        arg: String,
        alias: Option<String>,
    },
}

impl SelectItem {
    fn output_name(&self) -> String {
        match self {
            SelectItem::Star => "*".into(),
            SelectItem::Column(c) => c.clone(),
            SelectItem::Aggregate { func, arg, alias } => {
                alias.clone().unwrap_or_else(|| format!("{}({})", func, arg))
            }
        }
    }
}

struct Parsed {
    distinct: bool,
    select: Vec<SelectItem>,
    table: String,
    filters: Vec<(String, CompareOp)>,
    group_by: Vec<String>,
    order_by: Vec<(String, bool)>,
    limit: bool,
    offset: bool,
}

fn split_off<'a>(s: &'a str, keyword: &str) -> (&'a str, Option<&'a str>) {
    match s.split_once(keyword) {
        Some((head, tail)) => (head, Some(tail)),
        None => (s, None),
    }
}

fn parse(sql: &str) -> Result<Parsed, String> {
    let rest = sql
        .strip_prefix("SELECT ")
        .ok_or_else(|| format!("unsupported statement: {}", sql))?;
    let (distinct, rest) = match rest.strip_prefix("DISTINCT ") {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let (select, rest) = rest
        .split_once(" FROM ")
        .ok_or_else(|| format!("missing FROM: {}", sql))?;

    let (rest, offset) = match rest.strip_suffix(" OFFSET ?") {
        Some(r) => (r, true),
        None => (rest, false),
    };
    let (rest, limit) = match rest.strip_suffix(" LIMIT ?") {
        Some(r) => (r, true),
        None => (rest, false),
    };
    let (rest, order) = split_off(rest, " ORDER BY ");
    let (rest, group) = split_off(rest, " GROUP BY ");
    let (table, filter) = split_off(rest, " WHERE ");

    let select = select
        .split(", ")
        .map(|item| {
            if item == "*" {
                return SelectItem::Star;
            }
            match item.split_once('(') {
                Some((func, tail)) => {
                    let (arg, after) = tail.split_once(')').unwrap_or((tail, ""));
                    let alias = after.strip_prefix(" AS ").map(str::to_string);
                    SelectItem::Aggregate {
                        func: func.to_string(),
                        arg: arg.to_string(),
                        alias,
                    }
                }
                None => SelectItem::Column(item.to_string()),
            }
        })
        .collect();

    let filters = match filter {
        Some(f) => f
            .split(" AND ")
            .map(|cond| {
                let mut parts = cond.split_whitespace();
                let column = parts.next().unwrap_or_default().to_string();
                let op = parts
                    .next()
                    .and_then(CompareOp::parse)
                    .ok_or_else(|| format!("bad condition: {}", cond))?;
                Ok((column, op))
            })
            .collect::<Result<Vec<_>, String>>()?,
        None => Vec::new(),
    };

    let group_by = group
        .map(|g| g.split(", ").map(str::to_string).collect())
        .unwrap_or_default();
    let order_by = order
        .map(|o| {
            o.split(", ")
                .map(|k| {
                    let (col, dir) = k.split_once(' ').unwrap_or((k, "ASC"));
                    (col.to_string(), dir == "DESC")
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Parsed {
        distinct,
        select,
        table: table.to_string(),
        filters,
        group_by,
        order_by,
        limit,
        offset,
    })
}

#[derive(Clone)]
pub struct MemoryTable {
    pub columns: Vec<String>,
    pub rows: Vec<OwnedRow>,
}

impl MemoryTable {
    fn index(&self, column: &str) -> Result<usize, String> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| format!("unknown column {}", column))
    }
}

fn aggregate(func: &str, arg: &str, table: &MemoryTable, rows: &[&OwnedRow]) -> Result<Datum, String> {
    if func == "COUNT" && arg == "*" {
        return Ok(Datum::Int64(rows.len() as i64));
    }
    let idx = table.index(arg)?;
    let values = rows
        .iter()
        .filter_map(|r| r.get(idx))
        .filter(|v| !v.is_null());
    Ok(match func {
        "COUNT" => Datum::Int64(values.count() as i64),
        "SUM" => values.fold(Datum::Null, |acc, v| acc.add(v)),
        "MIN" => values.min().cloned().unwrap_or(Datum::Null),
        "MAX" => values.max().cloned().unwrap_or(Datum::Null),
        other => return Err(format!("unsupported function {}", other)),
    })
}

enum Output {
    Rows(ShardRows),
    Scalar(Datum),
}

fn execute(table: &MemoryTable, parsed: &Parsed, params: &[Datum]) -> Result<Output, String> {
    let mut params = params.iter();
    let mut rows: Vec<&OwnedRow> = table.rows.iter().collect();
    for (column, op) in &parsed.filters {
        let idx = table.index(column)?;
        let value = params.next().ok_or("missing filter parameter")?;
        rows.retain(|r| r.get(idx).is_some_and(|v| op.evaluate(v, value)));
    }
    let limit = if parsed.limit {
        params.next().and_then(Datum::as_i64).map(|n| n as usize)
    } else {
        None
    };
    let offset = if parsed.offset {
        params.next().and_then(Datum::as_i64).unwrap_or(0) as usize
    } else {
        0
    };

    let only_aggregate = parsed.group_by.is_empty()
        && parsed.select.len() == 1
        && matches!(parsed.select[0], SelectItem::Aggregate { alias: None, .. });
    if only_aggregate {
        if let SelectItem::Aggregate { func, arg, .. } = &parsed.select[0] {
            return Ok(Output::Scalar(aggregate(func, arg, table, &rows)?));
        }
    }

    let (columns, mut out): (Vec<String>, Vec<OwnedRow>) = if !parsed.group_by.is_empty() {
        let group_idx = parsed
            .group_by
            .iter()
            .map(|g| table.index(g))
            .collect::<Result<Vec<_>, _>>()?;
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut groups: HashMap<Vec<u8>, Vec<&OwnedRow>> = HashMap::new();
        for r in &rows {
            let key = r.encode_key(Some(group_idx.as_slice()));
            if !groups.contains_key(&key) {
                keys.push(key.clone());
            }
            groups.entry(key).or_default().push(r);
        }
        let columns = parsed.select.iter().map(SelectItem::output_name).collect();
        let mut out = Vec::new();
        for key in &keys {
            let members = &groups[key];
            let mut values = Vec::new();
            for item in &parsed.select {
                values.push(match item {
                    SelectItem::Column(c) => members[0].get(table.index(c)?).cloned().unwrap_or(Datum::Null),
                    SelectItem::Aggregate { func, arg, .. } => aggregate(func, arg, table, members)?,
                    SelectItem::Star => return Err("* with GROUP BY".into()),
                });
            }
            out.push(OwnedRow::new(values));
        }
        (columns, out)
    } else {
        let projected: Vec<usize> = match parsed.select.as_slice() {
            [SelectItem::Star] => (0..table.columns.len()).collect(),
            items => items
                .iter()
                .map(|i| match i {
                    SelectItem::Column(c) => table.index(c),
                    _ => Err("aggregate mixed with columns without GROUP BY".to_string()),
                })
                .collect::<Result<_, _>>()?,
        };
        let columns = projected.iter().map(|&i| table.columns[i].clone()).collect();
        let out = rows
            .iter()
            .map(|r| OwnedRow::new(projected.iter().map(|&i| r.values[i].clone()).collect()))
            .collect();
        (columns, out)
    };

    if !parsed.order_by.is_empty() {
        let keys = parsed
            .order_by
            .iter()
            .map(|(c, desc)| {
                columns
                    .iter()
                    .position(|x| x == c)
                    .map(|i| (i, *desc))
                    .ok_or_else(|| format!("unknown order column {}", c))
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| {
            for &(i, desc) in &keys {
                let ord = a.values[i].cmp(&b.values[i]);
                let ord = if desc { ord.reverse() } else { ord };
                if ord.is_ne() {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    if parsed.distinct {
        let mut seen = HashSet::new();
        out.retain(|r| seen.insert(r.encode_key(None)));
    }
    let out: Vec<OwnedRow> = out
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Ok(Output::Rows(ShardRows { columns, rows: out }))
}

// ── Cluster ──

#[derive(Debug, Clone)]
pub struct Call {
    pub data_source: String,
    pub table: String,
    pub sql: String,
    pub params: Vec<Datum>,
}

#[derive(Default)]
struct ClusterState {
    /// Keyed by `(data_source, table)`: one name may live on several stores.
    tables: Mutex<HashMap<(String, String), MemoryTable>>,
    failures: Mutex<HashMap<String, String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<Call>>,
    completed: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Shared handle to the in-memory cluster.
#[derive(Clone, Default)]
pub struct Cluster {
    state: Arc<ClusterState>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, data_source: &str, name: &str, columns: &[&str], rows: Vec<OwnedRow>) {
        self.state.tables.lock().insert(
            (data_source.to_string(), name.to_string()),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        );
    }

    pub fn fail_table(&self, name: &str, reason: &str) {
        self.state.failures.lock().insert(name.to_string(), reason.to_string());
    }

    pub fn delay_table(&self, name: &str, delay: Duration) {
        self.state.delays.lock().insert(name.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn calls_to(&self, table: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.table == table).collect()
    }

    pub fn calls_on(&self, data_source: &str, table: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.data_source == data_source && c.table == table)
            .collect()
    }

    pub fn touched(&self, table: &str) -> bool {
        !self.calls_to(table).is_empty()
    }

    pub fn completed(&self, table: &str) -> bool {
        self.state.completed.lock().iter().any(|t| t == table)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> Box<dyn ShardConnection> {
        Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
        })
    }

    /// Executor with `per_source` connections for each data source.
    pub fn executor(&self, data_sources: &[&str], per_source: usize) -> Arc<ShardExecutor> {
        let mut executor = ShardExecutor::new(Arc::new(FixtureCompiler));
        for ds in data_sources {
            let connections = (0..per_source).map(|_| self.connection()).collect();
            executor = executor.with_data_source(*ds, connections);
        }
        Arc::new(executor)
    }

    async fn run(&self, table: &ShardTable, statement: &Statement) -> ShardexResult<Output> {
        self.state.calls.lock().push(Call {
            data_source: table.data_source.clone(),
            table: table.name.clone(),
            sql: statement.sql.clone(),
            params: statement.params.clone(),
        });
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.state.in_flight);

        let delay = self.state.delays.lock().get(&table.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.completed.lock().push(table.name.clone());

        if let Some(reason) = self.state.failures.lock().get(&table.name).cloned() {
            return Err(ShardexError::Internal(reason));
        }
        let parsed = parse(&statement.sql).map_err(ShardexError::Internal)?;
        let data = self
            .state
            .tables
            .lock()
            .get(&(table.data_source.clone(), parsed.table.clone()))
            .cloned()
            .ok_or_else(|| {
                ShardexError::Internal(format!("no such table {}@{}", parsed.table, table.data_source))
            })?;
        execute(&data, &parsed, &statement.params).map_err(ShardexError::Internal)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemoryConnection {
    state: Arc<ClusterState>,
}

#[async_trait]
impl ShardConnection for MemoryConnection {
    async fn query_rows(&mut self, table: &ShardTable, statement: &Statement) -> ShardexResult<ShardRows> {
        let cluster = Cluster {
            state: Arc::clone(&self.state),
        };
        match cluster.run(table, statement).await? {
            Output::Rows(rows) => Ok(rows),
            Output::Scalar(_) => Err(ShardexError::Internal("expected rows, got scalar".into())),
        }
    }

    async fn query_scalar(&mut self, table: &ShardTable, statement: &Statement) -> ShardexResult<Datum> {
        let cluster = Cluster {
            state: Arc::clone(&self.state),
        };
        match cluster.run(table, statement).await? {
            Output::Scalar(v) => Ok(v),
            Output::Rows(_) => Err(ShardexError::Internal("expected scalar, got rows".into())),
        }
    }
}

/// Factory opening connections to every data source of a cluster.
pub struct MemoryFactory {
    pub cluster: Cluster,
    pub data_sources: Vec<String>,
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    fn data_sources(&self) -> Vec<String> {
        self.data_sources.clone()
    }

    async fn connect(&self, _data_source: &str) -> ShardexResult<Box<dyn ShardConnection>> {
        Ok(self.cluster.connection())
    }
}

// ── Canned datasets ──

pub const ORDER_COLUMNS: &[&str] = &["id", "region", "amount"];

fn region_for(id: i64) -> &'static str {
    match id % 3 {
        0 => "eu",
        1 => "us",
        _ => "apac",
    }
}

/// `orders`: ids 1..=30 range-partitioned over three shards on two stores.
/// `amount` is `id * 10`.
pub fn orders_cluster() -> (Cluster, StaticRouter) {
    shardex_observability::init_tracing();
    let cluster = Cluster::new();
    let mut tables = Vec::new();
    for (i, (lo, hi)) in [(1i64, 10i64), (11, 20), (21, 30)].into_iter().enumerate() {
        let name = format!("orders_{}", i);
        let rows = (lo..=hi).map(|id| row![id, region_for(id), id * 10]).collect();
        let ds = if i == 1 { "ds1" } else { "ds0" };
        cluster.add_table(ds, &name, ORDER_COLUMNS, rows);
        tables.push(ShardTable::new(name, ds).with_range(ShardRange::new(lo, hi)));
    }
    // Route listed out of range order on purpose.
    tables.swap(0, 2);
    let router = StaticRouter::new().with_route("orders", RouteResult::ordered(tables, "id"));
    (cluster, router)
}

pub fn orders_context(pool_size: usize) -> (Cluster, ShardingContext) {
    let (cluster, router) = orders_cluster();
    let executor = cluster.executor(&["ds0", "ds1"], pool_size);
    let ctx = ShardingContext::new(Arc::new(router), executor, ShardingConfig::default());
    (cluster, ctx)
}

/// `orders` split over two stores under the same physical table name:
/// ids 1..=4 on `ds0`, ids 5..=10 on `ds1`, range-ordered on `id`.
pub fn split_store_context() -> (Cluster, ShardingContext) {
    shardex_observability::init_tracing();
    let cluster = Cluster::new();
    let mut tables = Vec::new();
    for (ds, lo, hi) in [("ds1", 5i64, 10i64), ("ds0", 1, 4)] {
        let rows = (lo..=hi).map(|id| row![id, region_for(id), id * 10]).collect();
        cluster.add_table(ds, "orders", ORDER_COLUMNS, rows);
        tables.push(ShardTable::new("orders", ds).with_range(ShardRange::new(lo, hi)));
    }
    let router = StaticRouter::new().with_route("orders", RouteResult::ordered(tables, "id"));
    let executor = cluster.executor(&["ds0", "ds1"], 2);
    let ctx = ShardingContext::new(Arc::new(router), executor, ShardingConfig::default());
    (cluster, ctx)
}

/// Unordered route over shards with the given row counts; ids are globally
/// unique and `amount` equals the id.
pub fn counted_context(counts: &[usize], config: ShardingConfig) -> (Cluster, ShardingContext) {
    shardex_observability::init_tracing();
    let cluster = Cluster::new();
    let mut tables = Vec::new();
    let mut next_id = 1i64;
    for (i, &n) in counts.iter().enumerate() {
        let name = format!("events_{}", i);
        let rows = (0..n)
            .map(|_| {
                let id = next_id;
                next_id += 1;
                row![id, region_for(id), id]
            })
            .collect();
        cluster.add_table("ds0", &name, ORDER_COLUMNS, rows);
        tables.push(ShardTable::new(name, "ds0"));
    }
    let router = StaticRouter::new().with_route("events", RouteResult::unordered(tables));
    let executor = cluster.executor(&["ds0"], 4);
    let ctx = ShardingContext::new(Arc::new(router), executor, config);
    (cluster, ctx)
}

pub fn ids(rows: &[OwnedRow]) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get(0).and_then(Datum::as_i64).unwrap_or(-1))
        .collect()
}

pub fn token() -> CancelToken {
    CancelToken::new()
}
