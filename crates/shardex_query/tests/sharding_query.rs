mod common;

use std::sync::Arc;

use common::{ids, orders_context, split_store_context, token, Cluster, FixtureCompiler, MemoryFactory};
use shardex_common::{row, Datum, PoolConfig};
use shardex_query::{
    CompareOp, ExecutionStrategy, Filter, HavingFilter, ProjectedColumn, AggregateOp, ShardExecutor,
};

#[tokio::test]
async fn test_take_narrows_monotonically() {
    let (_cluster, ctx) = orders_context(2);
    let q = ctx
        .query("orders")
        .order_by("id")
        .unwrap()
        .take(5)
        .unwrap()
        .take(3)
        .unwrap()
        .take(10)
        .unwrap();
    assert_eq!(q.plan().await.unwrap().model.take, Some(3));
    let rows = q.to_list(&token()).await.unwrap();
    assert_eq!(ids(&rows), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_negative_window_rejected_before_any_shard() {
    let (cluster, ctx) = orders_context(2);
    let err = ctx.query("orders").skip(-1).err().unwrap();
    assert!(err.is_user_error());
    let err = ctx.query("orders").take(-1).err().unwrap();
    assert!(err.is_user_error());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_ordered_merge_stops_before_unneeded_shard() {
    let (cluster, ctx) = orders_context(2);
    let q = ctx.query("orders").order_by("id").unwrap().take(12).unwrap();
    assert_eq!(q.strategy().await.unwrap(), ExecutionStrategy::OrderedMerge);

    let rows = q.to_list(&token()).await.unwrap();
    assert_eq!(ids(&rows), (1..=12).collect::<Vec<_>>());
    assert!(cluster.touched("orders_0"));
    assert!(cluster.touched("orders_1"));
    assert!(!cluster.touched("orders_2"));

    // The second shard is only asked for what the window still needs.
    let second = cluster.calls_to("orders_1");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].params.last(), Some(&Datum::Int64(2)));
}

#[tokio::test]
async fn test_ordered_merge_descending_walks_ranges_in_reverse() {
    let (cluster, ctx) = orders_context(2);
    let rows = ctx
        .query("orders")
        .order_by_desc("id")
        .unwrap()
        .take(12)
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    assert_eq!(ids(&rows), (19..=30).rev().collect::<Vec<_>>());
    assert!(!cluster.touched("orders_0"));
}

#[tokio::test]
async fn test_ordered_merge_skip_pushes_offset_past_counted_shards() {
    let (cluster, ctx) = orders_context(2);
    let rows = ctx
        .query("orders")
        .order_by("id")
        .unwrap()
        .skip(15)
        .unwrap()
        .take(3)
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec![16, 17, 18]);

    // The first shard lies entirely before the window: counted, never read.
    assert!(cluster.calls_to("orders_0").iter().all(|c| c.sql.contains("COUNT(")));
    let reads: Vec<_> = cluster
        .calls_to("orders_1")
        .into_iter()
        .filter(|c| !c.sql.contains("COUNT("))
        .collect();
    assert_eq!(reads.len(), 1);
    assert!(reads[0].sql.ends_with("LIMIT ? OFFSET ?"));
    assert_eq!(reads[0].params, vec![Datum::Int64(3), Datum::Int64(5)]);
    assert!(cluster.calls_to("orders_2").iter().all(|c| c.sql.contains("COUNT(")));
}

#[tokio::test]
async fn test_ordered_skip_tells_same_named_tables_apart() {
    let (cluster, ctx) = split_store_context();
    let rows = ctx
        .query("orders")
        .order_by("id")
        .unwrap()
        .skip(5)
        .unwrap()
        .take(3)
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec![6, 7, 8]);

    // The ds0 table holds ids 1..=4 and lies entirely before the window.
    assert!(cluster.calls_on("ds0", "orders").iter().all(|c| c.sql.contains("COUNT(")));
    let reads: Vec<_> = cluster
        .calls_on("ds1", "orders")
        .into_iter()
        .filter(|c| !c.sql.contains("COUNT("))
        .collect();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].params, vec![Datum::Int64(3), Datum::Int64(1)]);
}

#[tokio::test]
async fn test_sorted_merge_on_non_routing_column() {
    let (cluster, ctx) = orders_context(2);
    let q = ctx
        .query("orders")
        .order_by("region")
        .unwrap()
        .then_by_desc("id")
        .unwrap()
        .take(4)
        .unwrap();
    assert_eq!(q.strategy().await.unwrap(), ExecutionStrategy::SortedMerge);

    let rows = q.to_list(&token()).await.unwrap();
    assert_eq!(ids(&rows), vec![29, 26, 23, 20]);
    for shard in ["orders_0", "orders_1", "orders_2"] {
        let calls = cluster.calls_to(shard);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].params.last(), Some(&Datum::Int64(4)));
    }
}

#[tokio::test]
async fn test_sorted_merge_with_skip_fetches_skip_plus_take() {
    let (cluster, ctx) = orders_context(2);
    let rows = ctx
        .query("orders")
        .order_by_desc("amount")
        .unwrap()
        .skip(2)
        .unwrap()
        .take(3)
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    // amount is routed on id, not amount: heap merge, not range walk.
    assert_eq!(ids(&rows), vec![28, 27, 26]);
    assert_eq!(cluster.calls_to("orders_0")[0].params.last(), Some(&Datum::Int64(5)));
}

#[tokio::test]
async fn test_ordinary_returns_every_row() {
    let (_cluster, ctx) = orders_context(2);
    let q = ctx.query("orders");
    assert_eq!(q.strategy().await.unwrap(), ExecutionStrategy::Ordinary);
    let rows = q.to_list(&token()).await.unwrap();
    let mut got = ids(&rows);
    got.sort_unstable();
    assert_eq!(got, (1..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_ordinary_take_pushes_limit() {
    let (cluster, ctx) = orders_context(2);
    let rows = ctx
        .query("orders")
        .take(5)
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    for call in cluster.calls() {
        assert!(call.sql.ends_with("LIMIT ?"));
        assert_eq!(call.params, vec![Datum::Int64(5)]);
    }
}

#[tokio::test]
async fn test_distinct_dedupes_across_shards() {
    let (_cluster, ctx) = orders_context(2);
    let rows = ctx
        .query("orders")
        .select(vec![ProjectedColumn::column("region")])
        .unwrap()
        .distinct()
        .unwrap()
        .to_list(&token())
        .await
        .unwrap();
    let mut regions: Vec<String> = rows
        .iter()
        .filter_map(|r| r.get(0).and_then(Datum::as_str).map(str::to_string))
        .collect();
    regions.sort();
    assert_eq!(regions, vec!["apac", "eu", "us"]);
}

#[tokio::test]
async fn test_first_and_any() {
    let (_cluster, ctx) = orders_context(2);
    let first = ctx
        .query("orders")
        .order_by("id")
        .unwrap()
        .first(&token())
        .await
        .unwrap();
    assert_eq!(first, Some(row![1i64, "us", 10i64]));

    let none = ctx
        .query("orders")
        .filter("id > ?", vec![Datum::Int64(100)])
        .unwrap();
    assert!(!none.any(&token()).await.unwrap());
    assert_eq!(none.first(&token()).await.unwrap(), None);
}

#[tokio::test]
async fn test_rows_cursor_streams() {
    let (_cluster, ctx) = orders_context(2);
    let mut cursor = ctx
        .query("orders")
        .order_by("id")
        .unwrap()
        .rows(&token())
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(row) = cursor.take_current() {
        seen.push(row);
        if !cursor.advance().await.unwrap() {
            break;
        }
    }
    assert_eq!(ids(&seen), (1..=30).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_grouped_merge_with_having_and_ordering() {
    let (_cluster, ctx) = orders_context(2);
    let q = ctx
        .query("orders")
        .group_by(&["region"])
        .unwrap()
        .select(vec![
            ProjectedColumn::column("region"),
            ProjectedColumn::aggregate(AggregateOp::Sum, Some("amount"), "total"),
            ProjectedColumn::aggregate(AggregateOp::Count, None, "n"),
        ])
        .unwrap()
        .having(HavingFilter::new("total", CompareOp::Gt, 1500i64))
        .unwrap()
        .order_by_desc("total")
        .unwrap();
    assert_eq!(q.strategy().await.unwrap(), ExecutionStrategy::Grouped);

    let rows = q.to_list(&token()).await.unwrap();
    assert_eq!(
        rows,
        vec![row!["eu", 1650i64, 10i64], row!["apac", 1550i64, 10i64]]
    );
}

#[tokio::test]
async fn test_global_filter_and_ignore_all_filters() {
    let (_cluster, ctx) = orders_context(2);
    let ctx = ctx.with_global_filter("orders", Filter::new("amount <= ?", vec![Datum::Int64(50)]));
    assert_eq!(ctx.query("orders").long_count(&token()).await.unwrap(), 5);
    let all = ctx.query("orders").ignore_all_filters().unwrap();
    assert_eq!(all.long_count(&token()).await.unwrap(), 30);
}

#[tokio::test]
async fn test_illegal_operator_sequences() {
    let (cluster, ctx) = orders_context(2);
    assert!(ctx.query("orders").then_by("id").err().unwrap().is_user_error());
    assert!(ctx
        .query("orders")
        .take(3)
        .unwrap()
        .order_by("id")
        .err()
        .unwrap()
        .is_user_error());
    let err = ctx
        .query("orders")
        .order_by("amount")
        .unwrap()
        .select(vec![ProjectedColumn::column("id")])
        .unwrap()
        .to_list(&token())
        .await
        .unwrap_err();
    assert!(err.is_user_error());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_table_is_a_routing_error() {
    let (_cluster, ctx) = orders_context(2);
    let err = ctx.query("nope").to_list(&token()).await.unwrap_err();
    assert!(err.is_user_error());
}

#[tokio::test]
async fn test_executor_opens_pools_from_factory() {
    let cluster = Cluster::new();
    let factory = MemoryFactory {
        cluster,
        data_sources: vec!["ds0".into(), "ds1".into()],
    };
    let config = PoolConfig {
        max_connections_per_source: 3,
    };
    let executor = ShardExecutor::connect(Arc::new(FixtureCompiler), &factory, &config)
        .await
        .unwrap();
    let stats = executor.pool_stats("ds1").unwrap();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.available, 3);
    assert!(executor.pool_stats("ds9").is_none());
}

#[test]
fn test_blocking_twins_share_the_async_path() {
    let (_cluster, ctx) = orders_context(2);
    let q = ctx.query("orders").order_by("id").unwrap();

    let rows = q.clone().take(4).unwrap().to_list_blocking(&token()).unwrap();
    assert_eq!(ids(&rows), vec![1, 2, 3, 4]);

    let streamed: Vec<_> = q
        .clone()
        .skip(27)
        .unwrap()
        .rows_blocking(&token())
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(ids(&streamed), vec![28, 29, 30]);

    assert_eq!(q.long_count_blocking(&token()).unwrap(), 30);
    assert_eq!(q.first_blocking(&token()).unwrap(), Some(row![1i64, "us", 10i64]));
    assert!(q.any_blocking(&token()).unwrap());

    let page = q.paging_blocking(2, 10, &token()).unwrap();
    assert_eq!(page.totals, 30);
    assert_eq!(ids(&page.data_list), (11..=20).collect::<Vec<_>>());
}
