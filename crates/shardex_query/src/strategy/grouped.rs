//! GROUP BY across shards: each shard groups locally, the coordinator merges
//! partial groups by key, then applies HAVING, ordering and the window.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use shardex_common::{CancelToken, OwnedRow, PlanError, ShardexError, ShardexResult};

use crate::compiler::ShardQuery;
use crate::executor::{PartialResult, ShardRows};
use crate::plan::{AggregateOp, ProjectedColumn, QueryModel};
use crate::sequence::{BoxCursor, VecCursor};

use super::{compare_rows, dispatch_rows, gather_all, resolve_sort_columns, StrategyContext, Window};

pub(crate) async fn open(ctx: &StrategyContext, cancel: CancelToken) -> ShardexResult<BoxCursor<OwnedRow>> {
    let model = ctx.model();
    let query = ShardQuery::rows(ctx.plan.clone(), 0, None);
    let results = gather_all(dispatch_rows(ctx, &query, &cancel)).await?;

    let Some(columns) = results
        .iter()
        .find(|r| !r.value.columns.is_empty())
        .map(|r| r.value.columns.clone())
    else {
        return Ok(Box::new(VecCursor::new(Vec::new(), cancel)));
    };

    let mut rows = merge_groups(model, &columns, &results)?;
    let merged = rows.len();
    ctx.config.check_buffered(merged)?;
    shardex_observability::record_rows_buffered("grouped", merged);

    for having in &model.having {
        let idx = column_index(&columns, &having.column)?;
        rows.retain(|row| row.get(idx).is_some_and(|v| having.op.evaluate(v, &having.value)));
    }
    if !model.ordering.is_empty() {
        let sort_columns = resolve_sort_columns(&columns, &model.ordering)?;
        rows.sort_by(|a, b| compare_rows(a, b, &sort_columns));
    }
    tracing::debug!(
        table = %model.logical_table,
        groups = merged,
        kept = rows.len(),
        "grouped merge"
    );

    let rows = Window::for_model(model).apply(rows);
    Ok(Box::new(VecCursor::new(rows, cancel)))
}

fn column_index(columns: &[String], name: &str) -> ShardexResult<usize> {
    columns.iter().position(|c| c == name).ok_or_else(|| {
        ShardexError::from(PlanError::Unsupported(format!(
            "column '{}' is not part of the grouped result",
            name
        )))
    })
}

/// Merge rows sharing a group key. Groups keep first-seen order.
fn merge_groups(
    model: &QueryModel,
    columns: &[String],
    results: &[PartialResult<ShardRows>],
) -> ShardexResult<Vec<OwnedRow>> {
    let group_indices = model
        .group_by
        .iter()
        .map(|g| column_index(columns, g))
        .collect::<ShardexResult<Vec<_>>>()?;
    let merges = model
        .projection
        .iter()
        .filter_map(|c| match c {
            ProjectedColumn::Aggregate { op, alias, .. } => Some((alias, *op)),
            ProjectedColumn::Column(_) => None,
        })
        .map(|(alias, op)| column_index(columns, alias).map(|idx| (idx, op)))
        .collect::<ShardexResult<Vec<(usize, AggregateOp)>>>()?;

    let mut positions: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut groups: Vec<OwnedRow> = Vec::new();
    for result in results {
        for row in &result.value.rows {
            match positions.entry(row.encode_key(Some(group_indices.as_slice()))) {
                Entry::Vacant(e) => {
                    e.insert(groups.len());
                    groups.push(row.clone());
                }
                Entry::Occupied(e) => {
                    let existing = &mut groups[*e.get()];
                    for &(idx, op) in &merges {
                        if let (Some(slot), Some(incoming)) = (existing.values.get_mut(idx), row.get(idx)) {
                            *slot = op.merge(slot, incoming);
                        }
                    }
                }
            }
        }
    }
    Ok(groups)
}
