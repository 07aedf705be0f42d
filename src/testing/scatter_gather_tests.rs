//! Scenario tests for routing and scatter-gather execution.
//!
//! These tests drive a [`ShardedStore`] over [`MemoryBackend`] shards and
//! assert on per-shard call logs and stored rows.

#[cfg(test)]
mod tests {
    use crate::backend::BackendError;
    use crate::config::{AverageStrategy, ShardingConfig};
    use crate::error::Error;
    use crate::sharding::{
        FilterPredicate, FnShardFunction, ModuloShardFunction, ShardConfig, ShardedStore,
    };
    use crate::testing::{BackendCall, MemoryBackend};
    use crate::types::{AggregateKind, KeyValue, Query, Row, RoutingOptions, ShardId, Value};
    use rust_decimal::Decimal;
    use std::sync::Arc;

    fn shards(n: usize) -> Vec<Arc<MemoryBackend>> {
        (0..n)
            .map(|i| Arc::new(MemoryBackend::new(format!("shard-{}", i))))
            .collect()
    }

    fn store_with(backends: &[Arc<MemoryBackend>], config: ShardingConfig) -> ShardedStore<MemoryBackend> {
        ShardedStore::builder()
            .shards(ShardConfig::ordered(backends.iter().cloned()))
            .shard_function(ModuloShardFunction::new(backends.len() as u32))
            .config(config)
            .build()
            .unwrap()
    }

    fn store(backends: &[Arc<MemoryBackend>]) -> ShardedStore<MemoryBackend> {
        store_with(backends, ShardingConfig::new().with_shard_key("tenant_id"))
    }

    fn order(id: i64, tenant: i64) -> Row {
        Row::new().with("id", id).with("tenant_id", tenant)
    }

    fn ids(rows: &[Row]) -> Vec<KeyValue> {
        rows.iter().filter_map(|r| r.key("id")).collect()
    }

    #[tokio::test]
    async fn test_grouped_insert_partitions_by_shard() {
        let backends = shards(2);
        let store = store(&backends);

        let rows = (1..=4).map(|k| order(k * 10, k)).collect();
        let result = store
            .executor()
            .insert_all("orders", rows, &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(result.count, 4);
        assert_eq!(result.rows.as_ref().map(Vec::len), Some(4));

        let tenants = |b: &MemoryBackend| -> Vec<KeyValue> {
            b.rows("orders").iter().filter_map(|r| r.key("tenant_id")).collect()
        };
        assert_eq!(tenants(&backends[0]), vec![KeyValue::Int(2), KeyValue::Int(4)]);
        assert_eq!(tenants(&backends[1]), vec![KeyValue::Int(1), KeyValue::Int(3)]);

        // Every shard received a group
        let stats = store.metrics().snapshot();
        assert_eq!(stats.broadcasts, 1);
        assert_eq!(stats.pruned_routes, 0);

        // One batch call per shard
        for backend in &backends {
            assert_eq!(
                backend.calls(),
                vec![BackendCall::InsertAll {
                    source: "orders".to_string(),
                    rows: 2
                }]
            );
        }
    }

    #[tokio::test]
    async fn test_grouped_insert_on_some_shards_is_pruned() {
        let backends = shards(3);
        let store = store(&backends);

        let rows = vec![order(1, 1), order(2, 4)];
        store
            .executor()
            .insert_all("orders", rows, &RoutingOptions::new())
            .await
            .unwrap();

        let stats = store.metrics().snapshot();
        assert_eq!(stats.pruned_routes, 1);
        assert_eq!(stats.broadcasts, 0);
        assert_eq!(backends[1].rows("orders").len(), 2);
    }

    #[tokio::test]
    async fn test_grouped_insert_requires_shard_key_on_every_row() {
        let backends = shards(2);
        let store = store(&backends);

        let rows = vec![order(1, 1), Row::new().with("id", 2)];
        let result = store
            .executor()
            .insert_all("orders", rows, &RoutingOptions::new())
            .await;

        assert!(matches!(result, Err(Error::ShardKeyMissing { column }) if column == "tenant_id"));
        assert!(backends.iter().all(|b| b.call_count() == 0));
    }

    #[tokio::test]
    async fn test_grouped_insert_without_routing_column() {
        let backends = shards(2);
        let store = store_with(&backends, ShardingConfig::new());

        let result = store
            .executor()
            .insert_all("orders", vec![order(1, 1)], &RoutingOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(Error::MissingRoutingKey {
                operation: "insert_all"
            })
        ));

        let result = store
            .executor()
            .insert_all(
                "orders",
                vec![order(1, 1), order(2, 2)],
                &RoutingOptions::new().route_by("tenant_id"),
            )
            .await
            .unwrap();
        assert_eq!(result.count, 2);
    }

    #[tokio::test]
    async fn test_broadcast_read_concatenates_in_registry_order() {
        let backends = shards(3);
        backends[0].seed("orders", vec![order(1, 0), order(4, 3)]);
        backends[1].seed("orders", vec![order(2, 1)]);
        backends[2].seed("orders", vec![order(3, 2)]);
        let store = store(&backends);

        let rows = store
            .executor()
            .all(&Query::new("orders"), &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(
            ids(&rows),
            vec![KeyValue::Int(1), KeyValue::Int(4), KeyValue::Int(2), KeyValue::Int(3)]
        );
        assert!(backends.iter().all(|b| b.call_count() == 1));
        assert_eq!(store.metrics().snapshot().broadcasts, 1);
    }

    #[tokio::test]
    async fn test_one_call_per_distinct_shard() {
        let backends = shards(4);
        let store = store(&backends);

        // 1, 5, 9 -> shard 1; 2, 6 -> shard 2
        let query = Query::new("orders").within("tenant_id", [1, 5, 9, 2, 6]);
        store
            .executor()
            .all(&query, &RoutingOptions::new())
            .await
            .unwrap();

        let calls: Vec<usize> = backends.iter().map(|b| b.call_count()).collect();
        assert_eq!(calls, vec![0, 1, 1, 0]);
        assert_eq!(store.metrics().snapshot().pruned_routes, 1);
        assert_eq!(store.metrics().backend_calls.get(), 2);
    }

    #[tokio::test]
    async fn test_integral_decimal_literal_reaches_its_shard() {
        let backends = shards(3);
        backends[2].seed("orders", vec![order(7, 2)]);
        let store = store(&backends);

        let query = Query::new("orders").within(
            "tenant_id",
            [Value::Int(1), Value::Decimal(Decimal::new(20, 1))],
        );
        let rows = store
            .executor()
            .all(&query, &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(ids(&rows), vec![KeyValue::Int(7)]);
        let calls: Vec<usize> = backends.iter().map(|b| b.call_count()).collect();
        assert_eq!(calls, vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn test_non_key_literal_broadcasts() {
        let backends = shards(3);
        let store = store(&backends);

        let query = Query::new("orders").within(
            "tenant_id",
            [Value::Int(1), Value::Decimal(Decimal::new(25, 1))],
        );
        store
            .executor()
            .all(&query, &RoutingOptions::new())
            .await
            .unwrap();

        assert!(backends.iter().all(|b| b.call_count() == 1));
        assert_eq!(store.metrics().snapshot().broadcasts, 1);
    }

    #[tokio::test]
    async fn test_routed_read_uses_route_by_column() {
        let backends = shards(3);
        backends[1].seed("orders", vec![order(1, 4)]);
        let store = store_with(&backends, ShardingConfig::new());

        let query = Query::new("orders").eq("tenant_id", 4);

        // No shard key configured: broadcast
        store
            .executor()
            .all(&query, &RoutingOptions::new())
            .await
            .unwrap();
        assert!(backends.iter().all(|b| b.call_count() == 1));

        backends.iter().for_each(|b| b.clear_calls());
        let rows = store
            .executor()
            .all(&query, &RoutingOptions::new().route_by("tenant_id"))
            .await
            .unwrap();

        assert_eq!(ids(&rows), vec![KeyValue::Int(1)]);
        let calls: Vec<usize> = backends.iter().map(|b| b.call_count()).collect();
        assert_eq!(calls, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_count_sums_partials() {
        let backends = shards(2);
        backends[0].seed("orders", (0..3).map(|i| order(i, 0)));
        backends[1].seed("orders", (0..5).map(|i| order(i, 1)));
        let store = store(&backends);

        let count = store
            .executor()
            .count(&Query::new("orders"), &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(count, 8);
    }

    #[tokio::test]
    async fn test_exists_is_logical_or() {
        let backends = shards(3);
        backends[2].seed("orders", vec![order(1, 2).with("status", "open")]);
        let store = store(&backends);
        let options = RoutingOptions::new();

        let open = Query::new("orders").eq("status", "open");
        let closed = Query::new("orders").eq("status", "closed");

        assert!(store.executor().exists(&open, &options).await.unwrap());
        assert!(!store.executor().exists(&closed, &options).await.unwrap());
    }

    fn amounts(backends: &[Arc<MemoryBackend>]) {
        // shard 0: one row of 10; shard 1: three rows summing 6
        backends[0].seed("orders", vec![order(1, 0).with("amount", 10)]);
        backends[1].seed(
            "orders",
            vec![
                order(2, 1).with("amount", 1),
                order(3, 1).with("amount", 2),
                order(4, 1).with("amount", Decimal::new(30, 1)),
            ],
        );
    }

    #[tokio::test]
    async fn test_sum_min_max() {
        let backends = shards(2);
        amounts(&backends);
        let store = store(&backends);
        let query = Query::new("orders");
        let options = RoutingOptions::new();

        assert_eq!(
            store.executor().sum(&query, "amount", &options).await.unwrap(),
            Decimal::from(16)
        );
        assert_eq!(
            store.executor().min(&query, "amount", &options).await.unwrap(),
            Some(Value::Int(1))
        );
        assert_eq!(
            store.executor().max(&query, "amount", &options).await.unwrap(),
            Some(Value::Int(10))
        );
    }

    #[tokio::test]
    async fn test_sum_over_empty_shards_is_zero() {
        let backends = shards(2);
        let store = store(&backends);

        let sum = store
            .executor()
            .sum(&Query::new("orders"), "amount", &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(sum, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_avg_is_row_weighted_by_default() {
        let backends = shards(2);
        amounts(&backends);
        let store = store(&backends);

        let avg = store
            .executor()
            .avg(&Query::new("orders"), "amount", &RoutingOptions::new())
            .await
            .unwrap();

        assert_eq!(avg, Some(Decimal::from(4)));
    }

    #[tokio::test]
    async fn test_avg_mean_of_shard_averages() {
        let backends = shards(2);
        amounts(&backends);
        let store = store_with(
            &backends,
            ShardingConfig::new().with_average_strategy(AverageStrategy::MeanOfShardAverages),
        );

        let avg = store
            .executor()
            .avg(&Query::new("orders"), "amount", &RoutingOptions::new())
            .await
            .unwrap();

        // (10 + 2) / 2
        assert_eq!(avg, Some(Decimal::from(6)));
    }

    #[tokio::test]
    async fn test_aggregate_dispatch() {
        let backends = shards(2);
        amounts(&backends);
        let store = store(&backends);
        let query = Query::new("orders");
        let options = RoutingOptions::new();

        let count = store
            .executor()
            .aggregate(&query, AggregateKind::Count, None, &options)
            .await
            .unwrap();
        assert_eq!(count, Some(Value::Int(4)));

        let max = store
            .executor()
            .aggregate(&query, AggregateKind::Max, Some("amount"), &options)
            .await
            .unwrap();
        assert_eq!(max, Some(Value::Int(10)));

        let result = store
            .executor()
            .aggregate(&query, AggregateKind::Sum, None, &options)
            .await;
        assert!(matches!(
            result,
            Err(Error::MissingField {
                kind: AggregateKind::Sum
            })
        ));
    }

    #[tokio::test]
    async fn test_point_lookups_require_shard_value() {
        let backends = shards(2);
        backends[1].seed("orders", vec![order(7, 3)]);
        let store = store(&backends);
        let executor = store.executor();

        assert!(matches!(
            executor.get("orders", 7, &RoutingOptions::new()).await,
            Err(Error::MissingRoutingKey { operation: "get" })
        ));
        assert!(matches!(
            executor
                .get_by("orders", vec![FilterPredicate::eq("id", 7)], &RoutingOptions::new())
                .await,
            Err(Error::MissingRoutingKey { operation: "get_by" })
        ));
        assert!(matches!(
            executor
                .one(&Query::new("orders").eq("tenant_id", 3), &RoutingOptions::new())
                .await,
            Err(Error::MissingRoutingKey { operation: "one" })
        ));
        assert!(backends.iter().all(|b| b.call_count() == 0));

        let found = executor
            .get("orders", 7, &RoutingOptions::new().shard_value(3))
            .await
            .unwrap();
        assert_eq!(found.and_then(|r| r.key("id")), Some(KeyValue::Int(7)));
        assert_eq!(backends[0].call_count(), 0);
        assert_eq!(backends[1].call_count(), 1);
    }

    #[tokio::test]
    async fn test_single_result_lookup_rejects_multiple_rows() {
        let backends = shards(2);
        backends[0].seed("orders", vec![order(1, 2), order(2, 2)]);
        let store = store(&backends);
        let options = RoutingOptions::new().shard_value(2);

        let result = store
            .executor()
            .one(&Query::new("orders").eq("tenant_id", 2), &options)
            .await;
        assert!(matches!(result, Err(Error::MultipleResults { count: 2 })));

        let row = store
            .executor()
            .get_by("orders", vec![FilterPredicate::eq("id", 2)], &options)
            .await
            .unwrap();
        assert_eq!(row.and_then(|r| r.key("id")), Some(KeyValue::Int(2)));

        let missing = store
            .executor()
            .get_by("orders", vec![FilterPredicate::eq("id", 9)], &options)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_single_entity_writes() {
        let backends = shards(2);
        let store = store(&backends);
        let executor = store.executor();

        let inserted = executor
            .insert("orders", order(1, 3), &RoutingOptions::new())
            .await
            .unwrap();
        assert_eq!(inserted.count, 1);
        assert_eq!(backends[1].rows("orders").len(), 1);
        assert!(backends[0].rows("orders").is_empty());

        let updated = executor
            .update(
                "orders",
                order(1, 3).with("status", "shipped"),
                &RoutingOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(updated.count, 1);
        assert_eq!(
            backends[1].rows("orders")[0].get("status"),
            Some(&Value::from("shipped"))
        );

        let deleted = executor
            .delete("orders", Row::new().with("id", 1), &RoutingOptions::new().shard_value(3))
            .await
            .unwrap();
        assert_eq!(deleted.count, 1);
        assert!(backends[1].rows("orders").is_empty());
    }

    #[tokio::test]
    async fn test_single_entity_write_without_routing() {
        let backends = shards(2);
        let store = store_with(&backends, ShardingConfig::new());

        let result = store
            .executor()
            .delete("orders", Row::new().with("id", 1), &RoutingOptions::new())
            .await;

        assert!(matches!(
            result,
            Err(Error::MissingRoutingKey { operation: "delete" })
        ));
    }

    #[tokio::test]
    async fn test_single_entity_write_without_shard_key_field() {
        let backends = shards(2);
        let store = store(&backends);
        let executor = store.executor();
        let entity = || Row::new().with("id", 1).with("status", "shipped");

        let updated = executor.update("orders", entity(), &RoutingOptions::new()).await;
        let deleted = executor.delete("orders", entity(), &RoutingOptions::new()).await;
        let inserted = executor.insert("orders", entity(), &RoutingOptions::new()).await;

        assert!(matches!(
            updated,
            Err(Error::MissingRoutingKey { operation: "update" })
        ));
        assert!(matches!(
            deleted,
            Err(Error::MissingRoutingKey { operation: "delete" })
        ));
        assert!(matches!(
            inserted,
            Err(Error::MissingRoutingKey { operation: "insert" })
        ));
        assert!(backends.iter().all(|b| b.call_count() == 0));
    }

    #[tokio::test]
    async fn test_filter_routed_writes_merge_counts() {
        let backends = shards(3);
        for (i, backend) in backends.iter().enumerate() {
            backend.seed("orders", (0..=i as i64).map(|n| order(n, i as i64)));
        }
        let store = store(&backends);
        let executor = store.executor();

        let changes = Row::new().with("status", "archived");
        let updated = executor
            .update_all(&Query::new("orders"), &changes, &RoutingOptions::new())
            .await
            .unwrap();
        assert_eq!(updated.count, 6);
        assert!(updated.rows.is_none());

        let deleted = executor
            .delete_all(&Query::new("orders").within("tenant_id", [0, 2]), &RoutingOptions::new())
            .await
            .unwrap();
        assert_eq!(deleted.count, 4);
        assert_eq!(backends[1].rows("orders").len(), 2);
        assert_eq!(backends[1].call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_propagates_without_compensation() {
        let backends = shards(3);
        for backend in &backends {
            backend.seed("orders", vec![order(1, 0)]);
        }
        backends[1].fail_next(BackendError::Unavailable("connection reset".to_string()));
        let store = store(&backends);

        let result = store
            .executor()
            .update_all(
                &Query::new("orders"),
                &Row::new().with("status", "archived"),
                &RoutingOptions::new(),
            )
            .await;

        match result {
            Err(Error::Backend { shard, source }) => {
                assert_eq!(shard, ShardId::Index(1));
                assert_eq!(source, BackendError::Unavailable("connection reset".to_string()));
            }
            other => panic!("expected backend error, got {:?}", other),
        }

        // Every call was issued; completed shards keep their write
        assert!(backends.iter().all(|b| b.call_count() == 1));
        let archived = Value::from("archived");
        assert_eq!(backends[0].rows("orders")[0].get("status"), Some(&archived));
        assert_eq!(backends[1].rows("orders")[0].get("status"), None);
        assert_eq!(backends[2].rows("orders")[0].get("status"), Some(&archived));
        assert_eq!(store.metrics().backend_errors.get(), 1);
    }

    #[tokio::test]
    async fn test_keyed_shards_with_custom_function() {
        let eu = Arc::new(MemoryBackend::new("eu"));
        let us = Arc::new(MemoryBackend::new("us"));
        eu.seed("users", vec![Row::new().with("id", 1).with("region", "eu-paris")]);
        us.seed("users", vec![Row::new().with("id", 2).with("region", "us-east")]);

        let store = ShardedStore::builder()
            .shards(ShardConfig::keyed(vec![("eu", eu.clone()), ("us", us.clone())]))
            .shard_function(FnShardFunction::new("region", |value: &KeyValue| {
                match value.as_bytes() {
                    Some(b) if b.starts_with(b"eu") => ShardId::from("eu"),
                    _ => ShardId::from("us"),
                }
            }))
            .config(ShardingConfig::new().with_shard_key("region"))
            .build()
            .unwrap();

        let rows = store
            .executor()
            .all(
                &Query::new("users").eq("region", "eu-paris"),
                &RoutingOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(ids(&rows), vec![KeyValue::Int(1)]);
        assert_eq!(eu.call_count(), 1);
        assert_eq!(us.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_shard_from_function() {
        let backends = shards(2);
        let store = ShardedStore::builder()
            .shards(ShardConfig::ordered(backends.iter().cloned()))
            .shard_function(ModuloShardFunction::new(3))
            .config(ShardingConfig::new().with_shard_key("tenant_id"))
            .build()
            .unwrap();

        let result = store
            .executor()
            .all(&Query::new("orders").eq("tenant_id", 2), &RoutingOptions::new())
            .await;

        assert!(matches!(result, Err(Error::UnknownShard(ShardId::Index(2)))));
        assert!(backends.iter().all(|b| b.call_count() == 0));
    }
}
