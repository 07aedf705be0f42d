//! Scenario tests for atomic cross-shard rounds.

#[cfg(test)]
mod tests {
    use crate::backend::{BackendError, BackendResult, ShardTransaction};
    use crate::config::{ShardingConfig, TransactionConfig};
    use crate::error::Error;
    use crate::sharding::{
        DeleteMatching, FailureReason, ModuloShardFunction, ShardConfig, ShardFailure,
        ShardOperation, ShardedStore, TransactionOutcome, UpdateMatching,
    };
    use crate::testing::MemoryBackend;
    use crate::types::{MutationResult, Query, Row, RoutingOptions, ShardId, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn shards(n: usize) -> Vec<Arc<MemoryBackend>> {
        (0..n)
            .map(|i| Arc::new(MemoryBackend::new(format!("shard-{}", i))))
            .collect()
    }

    fn store_with(
        backends: &[Arc<MemoryBackend>],
        transaction: TransactionConfig,
    ) -> ShardedStore<MemoryBackend> {
        ShardedStore::builder()
            .shards(ShardConfig::ordered(backends.iter().cloned()))
            .shard_function(ModuloShardFunction::new(backends.len() as u32))
            .config(
                ShardingConfig::new()
                    .with_shard_key("tenant_id")
                    .with_transaction_config(transaction),
            )
            .build()
            .unwrap()
    }

    fn store(backends: &[Arc<MemoryBackend>]) -> ShardedStore<MemoryBackend> {
        store_with(backends, TransactionConfig::new())
    }

    /// Writes one ledger row on every shard it runs on.
    #[derive(Debug)]
    struct WriteLedger;

    #[async_trait::async_trait]
    impl ShardOperation for WriteLedger {
        type Output = MutationResult;

        async fn apply(
            &self,
            shard: &ShardId,
            txn: &mut dyn ShardTransaction,
        ) -> BackendResult<MutationResult> {
            let row = Row::new()
                .with("id", 1)
                .with("shard", shard.to_string());
            txn.insert_all("ledger", vec![row]).await
        }
    }

    /// Inserts one row, or panics on the given shard.
    #[derive(Debug)]
    struct PanicOn(ShardId);

    #[async_trait::async_trait]
    impl ShardOperation for PanicOn {
        type Output = usize;

        async fn apply(&self, shard: &ShardId, txn: &mut dyn ShardTransaction) -> BackendResult<usize> {
            if *shard == self.0 {
                panic!("boom on {}", shard);
            }
            txn.insert_all("ledger", vec![Row::new().with("id", 1)])
                .await
                .map(|r| r.count as usize)
        }
    }

    fn committed_everywhere(backends: &[Arc<MemoryBackend>]) -> bool {
        backends.iter().all(|b| b.rows("ledger").len() == 1)
    }

    fn written_nowhere(backends: &[Arc<MemoryBackend>]) -> bool {
        backends.iter().all(|b| b.rows("ledger").is_empty())
    }

    #[tokio::test]
    async fn test_all_shards_succeed_commits_everywhere() {
        let backends = shards(3);
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        match &outcome {
            TransactionOutcome::Committed(successes) => {
                let order: Vec<ShardId> = successes.iter().map(|s| s.shard_id.clone()).collect();
                assert_eq!(order, vec![ShardId::Index(0), ShardId::Index(1), ShardId::Index(2)]);
                assert!(successes.iter().all(|s| s.value.count == 1));
            }
            other => panic!("expected commit, got {:?}", other),
        }
        assert!(committed_everywhere(&backends));
        assert!(backends.iter().all(|b| b.commits() == 1 && b.rollbacks() == 0));

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.transactions_started, 1);
        assert_eq!(snapshot.transactions_committed, 1);
        assert_eq!(snapshot.transactions_in_flight, 0);
    }

    #[tokio::test]
    async fn test_one_failing_shard_aborts_everywhere() {
        let backends = shards(3);
        backends[2].fail_transactions_with(BackendError::Conflict("row locked".to_string()));
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TransactionOutcome::Aborted(vec![ShardFailure {
                shard_id: ShardId::Index(2),
                reason: FailureReason::Operation(BackendError::Conflict("row locked".to_string())),
            }])
        );
        assert!(written_nowhere(&backends));
        assert!(backends.iter().all(|b| b.rollbacks() == 1 && b.commits() == 0));
        assert_eq!(store.metrics().snapshot().transactions_aborted, 1);
    }

    #[tokio::test]
    async fn test_failures_follow_participant_order() {
        let backends = shards(4);
        backends[3].fail_transactions_with(BackendError::Rejected("constraint".to_string()));
        backends[1].fail_transactions_with(BackendError::Conflict("locked".to_string()));
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        let failed: Vec<ShardId> = outcome.failures().iter().map(|f| f.shard_id.clone()).collect();
        assert_eq!(failed, vec![ShardId::Index(1), ShardId::Index(3)]);
        assert!(written_nowhere(&backends));
    }

    #[tokio::test]
    async fn test_panicking_operation_aborts() {
        let backends = shards(3);
        let store = store(&backends);

        let outcome = store
            .transaction(
                &Query::new("ledger"),
                &RoutingOptions::new(),
                PanicOn(ShardId::Index(0)),
            )
            .await
            .unwrap();

        assert_eq!(outcome.failures().len(), 1);
        assert_eq!(outcome.failures()[0].reason, FailureReason::Panicked);
        assert!(written_nowhere(&backends));
    }

    #[tokio::test]
    async fn test_transaction_participants_follow_routing() {
        let backends = shards(3);
        let store = store(&backends);

        let query = Query::new("ledger").within("tenant_id", [4, 7]);
        let outcome = store
            .transaction(&query, &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        assert_eq!(outcome.successes().len(), 1);
        assert_eq!(outcome.successes()[0].shard_id, ShardId::Index(1));
        assert_eq!(backends[1].rows("ledger").len(), 1);
        assert!(backends[0].rows("ledger").is_empty());
        assert_eq!(backends[0].call_count(), 0);
    }

    #[tokio::test]
    async fn test_transaction_on_explicit_shards() {
        let backends = shards(3);
        let store = store(&backends);

        let outcome = store
            .transaction_on(&[ShardId::Index(2), ShardId::Index(0), ShardId::Index(2)], WriteLedger)
            .await
            .unwrap();

        let order: Vec<ShardId> = outcome.successes().iter().map(|s| s.shard_id.clone()).collect();
        assert_eq!(order, vec![ShardId::Index(2), ShardId::Index(0)]);
        assert!(backends[1].rows("ledger").is_empty());

        let result = store.transaction_on(&[ShardId::from("missing")], WriteLedger).await;
        assert!(matches!(result, Err(Error::UnknownShard(_))));
    }

    #[tokio::test]
    async fn test_update_matching_is_atomic() {
        let backends = shards(2);
        for backend in &backends {
            backend.seed("orders", vec![Row::new().with("id", 1).with("status", "open")]);
        }
        backends[1].fail_transactions_with(BackendError::Unavailable("disk full".to_string()));
        let store = store(&backends);

        let op = UpdateMatching {
            query: Query::new("orders").eq("status", "open"),
            changes: Row::new().with("status", "closed"),
        };
        let outcome = store
            .transaction(&Query::new("orders"), &RoutingOptions::new(), op)
            .await
            .unwrap();

        assert!(!outcome.is_committed());
        let open = Value::from("open");
        assert!(backends
            .iter()
            .all(|b| b.rows("orders")[0].get("status") == Some(&open)));
    }

    #[tokio::test]
    async fn test_delete_matching_commits() {
        let backends = shards(2);
        for backend in &backends {
            backend.seed("orders", vec![Row::new().with("id", 1), Row::new().with("id", 2)]);
        }
        let store = store(&backends);

        let op = DeleteMatching {
            query: Query::new("orders").eq("id", 2),
        };
        let outcome = store
            .transaction(&Query::new("orders"), &RoutingOptions::new(), op)
            .await
            .unwrap();

        let deleted: u64 = outcome.successes().iter().map(|s| s.value.count).sum();
        assert_eq!(deleted, 2);
        assert!(backends.iter().all(|b| b.rows("orders").len() == 1));
    }

    #[tokio::test]
    async fn test_rejected_operation_rolls_back_other_shards() {
        #[derive(Debug)]
        struct Refuse;

        #[async_trait::async_trait]
        impl ShardOperation for Refuse {
            type Output = ();

            async fn apply(&self, shard: &ShardId, _txn: &mut dyn ShardTransaction) -> BackendResult<()> {
                if *shard == ShardId::Index(1) {
                    return Err(BackendError::Rejected("not allowed".to_string()));
                }
                Ok(())
            }
        }

        let backends = shards(2);
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), Refuse)
            .await
            .unwrap();

        assert_eq!(
            outcome.failures()[0].reason,
            FailureReason::Operation(BackendError::Rejected("not allowed".to_string()))
        );
        assert_eq!(backends[0].rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_decision_timeout_aborts_stalled_round() {
        let backends = shards(3);
        backends[1].hang_transactions();
        let store = store_with(
            &backends,
            TransactionConfig::new().with_decision_timeout(Duration::from_millis(100)),
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            store.transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger),
        )
        .await
        .expect("coordinator must not wait for stalled workers")
        .unwrap();

        assert_eq!(
            outcome.failures(),
            &[ShardFailure {
                shard_id: ShardId::Index(1),
                reason: FailureReason::TimedOut,
            }]
        );

        // Responsive shards roll back once they read the abort
        for _ in 0..50 {
            if backends[0].rollbacks() == 1 && backends[2].rollbacks() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backends[0].rollbacks(), 1);
        assert_eq!(backends[2].rollbacks(), 1);
        assert!(written_nowhere(&backends));

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.transactions_timed_out, 1);
        assert_eq!(snapshot.transactions_aborted, 1);
    }

    /// Tracks how many operations are running at once.
    #[derive(Debug, Default)]
    struct Concurrency {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[derive(Debug)]
    struct Tracked(Arc<Concurrency>);

    #[async_trait::async_trait]
    impl ShardOperation for Tracked {
        type Output = ();

        async fn apply(&self, _shard: &ShardId, _txn: &mut dyn ShardTransaction) -> BackendResult<()> {
            let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_max_concurrent_bounds_rounds() {
        let backends = shards(1);
        let store = Arc::new(store_with(
            &backends,
            TransactionConfig::new().with_max_concurrent(1),
        ));
        let tracker = Arc::new(Concurrency::default());

        let rounds: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    store
                        .transaction(&Query::new("ledger"), &RoutingOptions::new(), Tracked(tracker))
                        .await
                })
            })
            .collect();

        for round in rounds {
            assert!(round.await.unwrap().unwrap().is_committed());
        }
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(backends[0].commits(), 4);
    }

    #[tokio::test]
    async fn test_stalled_workers_keep_their_concurrency_permit() {
        let backends = shards(2);
        backends[1].hang_transactions();
        let store = store_with(
            &backends,
            TransactionConfig::new()
                .with_max_concurrent(1)
                .with_decision_timeout(Duration::from_millis(50)),
        );
        let both = [ShardId::Index(0), ShardId::Index(1)];

        let outcome = store.transaction_on(&both, WriteLedger).await.unwrap();
        assert_eq!(
            outcome.failures(),
            &[ShardFailure {
                shard_id: ShardId::Index(1),
                reason: FailureReason::TimedOut,
            }]
        );

        // The stalled shard still holds its scope, so no new round may start
        let blocked = tokio::time::timeout(
            Duration::from_millis(200),
            store.transaction_on(&[ShardId::Index(0)], WriteLedger),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(backends[1].open_scopes(), 1);
        assert_eq!(backends[0].open_scopes(), 0);

        // Once the stalled worker rolls back the permit is free again
        backends[1].release_transactions();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            store.transaction_on(&[ShardId::Index(0)], WriteLedger),
        )
        .await
        .expect("permit must be released when the stalled worker exits")
        .unwrap();

        assert!(outcome.is_committed());
        assert_eq!(backends[1].rollbacks(), 1);
        assert_eq!(backends[1].open_scopes(), 0);
        assert_eq!(backends[0].rows("ledger").len(), 1);
        assert!(backends[1].rows("ledger").is_empty());
    }

    #[tokio::test]
    async fn test_begin_failure_aborts_every_shard() {
        let backends = shards(3);
        let unavailable = BackendError::Unavailable("no scopes".to_string());
        backends[2].fail_begin_with(unavailable.clone());
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        assert_eq!(
            outcome.failures(),
            &[ShardFailure {
                shard_id: ShardId::Index(2),
                reason: FailureReason::Begin(unavailable),
            }]
        );
        assert_eq!(backends[0].rollbacks(), 1);
        assert_eq!(backends[1].rollbacks(), 1);
        assert!(backends.iter().all(|b| b.open_scopes() == 0));
        assert!(written_nowhere(&backends));
    }

    #[tokio::test]
    async fn test_worker_lost_before_reporting() {
        let backends = shards(2);
        backends[1].panic_on_begin();
        let store = store(&backends);

        let outcome = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await
            .unwrap();

        assert_eq!(
            outcome.failures(),
            &[ShardFailure {
                shard_id: ShardId::Index(1),
                reason: FailureReason::Lost,
            }]
        );
        assert_eq!(backends[0].rollbacks(), 1);
        assert!(written_nowhere(&backends));
    }

    #[tokio::test]
    async fn test_commit_failure_is_incomplete_commit() {
        let backends = shards(3);
        backends[1].fail_commit_with(BackendError::Other("disk full".to_string()));
        let store = store(&backends);

        let result = store
            .transaction(&Query::new("ledger"), &RoutingOptions::new(), WriteLedger)
            .await;

        match result {
            Err(Error::IncompleteCommit { shards }) => assert_eq!(shards, vec![ShardId::Index(1)]),
            other => panic!("expected IncompleteCommit, got {:?}", other),
        }

        // Shards that committed keep their writes
        assert_eq!(backends[0].rows("ledger").len(), 1);
        assert_eq!(backends[2].rows("ledger").len(), 1);
        assert_eq!(backends[0].commits(), 1);
        assert_eq!(backends[2].commits(), 1);
        assert!(backends[1].rows("ledger").is_empty());
        assert_eq!(backends[1].failed_commits(), 1);
    }
}
