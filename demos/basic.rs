//! Basic example of routing and atomic writes over in-memory shards.

use shardline::sharding::{ModuloShardFunction, ShardConfig, UpdateMatching};
use shardline::testing::MemoryBackend;
use shardline::{
    BackendError, Query, Row, RoutingOptions, ShardedStore, ShardingConfig, TransactionConfig,
    TransactionOutcome,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("shardline=debug,info")
        .init();

    let backends: Vec<Arc<MemoryBackend>> = (0..3)
        .map(|i| Arc::new(MemoryBackend::new(format!("shard-{}", i))))
        .collect();

    let config = ShardingConfig::new()
        .with_shard_key("tenant_id")
        .with_transaction_config(
            TransactionConfig::new()
                .with_decision_timeout(Duration::from_secs(2))
                .with_max_concurrent(16),
        );

    let store = ShardedStore::builder()
        .shards(ShardConfig::ordered(backends.iter().cloned()))
        .shard_function(ModuloShardFunction::new(3))
        .config(config)
        .build()?;

    println!("Store ready with {} shards", store.router().shards().len());

    // Grouped insert
    println!("\n--- Grouped Insert ---");
    let rows = (1..=9)
        .map(|i| {
            Row::new()
                .with("id", i)
                .with("tenant_id", i % 4)
                .with("amount", i * 10)
        })
        .collect();
    let inserted = store
        .executor()
        .insert_all("orders", rows, &RoutingOptions::new())
        .await?;
    println!("Inserted {} rows", inserted.count);
    for backend in &backends {
        println!("  {}: {} rows", backend.name(), backend.rows("orders").len());
    }

    // Routed and broadcast reads
    println!("\n--- Reads ---");
    let options = RoutingOptions::new();
    let tenant_two = Query::new("orders").eq("tenant_id", 2);
    let rows = store.executor().all(&tenant_two, &options).await?;
    println!("Tenant 2 has {} orders", rows.len());

    let everything = Query::new("orders");
    println!("Total orders: {}", store.executor().count(&everything, &options).await?);
    println!("Total amount: {}", store.executor().sum(&everything, "amount", &options).await?);
    if let Some(avg) = store.executor().avg(&everything, "amount", &options).await? {
        println!("Average amount: {}", avg);
    }

    // Atomic round that commits
    println!("\n--- Atomic Update ---");
    let archive = UpdateMatching {
        query: Query::new("orders"),
        changes: Row::new().with("status", "archived"),
    };
    match store.transaction(&everything, &options, archive).await? {
        TransactionOutcome::Committed(successes) => {
            for success in successes {
                println!("  shard {} updated {} rows", success.shard_id, success.value.count);
            }
        }
        TransactionOutcome::Aborted(failures) => {
            println!("  aborted on {} shards", failures.len());
        }
    }

    // Atomic round that aborts
    println!("\n--- Atomic Update With A Failing Shard ---");
    backends[1].fail_transactions_with(BackendError::Conflict("row locked".to_string()));
    let reopen = UpdateMatching {
        query: Query::new("orders"),
        changes: Row::new().with("status", "open"),
    };
    let outcome = store.transaction(&everything, &options, reopen).await?;
    for failure in outcome.failures() {
        println!("  shard {} failed: {}", failure.shard_id, failure.reason);
    }

    // Show stats
    let stats = store.metrics().snapshot();
    println!("\nMetrics:");
    println!("  Scatter operations: {}", stats.scatter_operations);
    println!("  Broadcasts: {}", stats.broadcasts);
    println!("  Pruned routes: {}", stats.pruned_routes);
    println!("  Backend calls: {}", stats.backend_calls);
    println!("  Transactions committed: {}", stats.transactions_committed);
    println!("  Transactions aborted: {}", stats.transactions_aborted);

    Ok(())
}
