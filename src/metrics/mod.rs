//! Metrics for routing, fan-out and atomic rounds.
//!
//! Plain atomic instruments, readable in-process through [`ShardingMetrics::snapshot`]
//! or rendered in Prometheus exposition format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ShardingMetrics                         │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────┐  │
//! │  │ Routing          │  │ Transactions     │  │ Gauges    │  │
//! │  │ - scatter ops    │  │ - started        │  │ - in      │  │
//! │  │ - broadcasts     │  │ - committed      │  │   flight  │  │
//! │  │ - pruned routes  │  │ - aborted        │  │           │  │
//! │  │ - backend calls  │  │ - timed out      │  │           │  │
//! │  └──────────────────┘  └──────────────────┘  └───────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::{Gauge, GaugeGuard};

use crate::sharding::RoutingDecision;
use crate::types::ShardId;

/// Instruments shared by the executor and the transaction coordinator.
#[derive(Debug)]
pub struct ShardingMetrics {
    // Routing
    /// Scatter-gather operations executed.
    pub scatter_operations: Counter,
    /// Operations that targeted every shard.
    pub broadcasts: Counter,
    /// Operations narrowed to a subset of shards.
    pub pruned_routes: Counter,
    /// Backend calls issued, total.
    pub backend_calls: Counter,
    /// Backend calls issued, by shard.
    pub backend_calls_by_shard: LabeledCounter,
    /// Backend calls that returned an error.
    pub backend_errors: Counter,

    // Transactions
    /// Atomic rounds started.
    pub transactions_started: Counter,
    /// Atomic rounds that committed everywhere.
    pub transactions_committed: Counter,
    /// Atomic rounds that rolled back.
    pub transactions_aborted: Counter,
    /// Atomic rounds aborted by the decision deadline.
    pub transactions_timed_out: Counter,
    /// Workers that received an unexpected decision message.
    pub protocol_violations: Counter,
    /// Atomic rounds currently holding shard scopes open.
    pub transactions_in_flight: Gauge,
}

impl ShardingMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            scatter_operations: Counter::new(
                "shardline_scatter_operations_total",
                "Scatter-gather operations executed",
            ),
            broadcasts: Counter::new(
                "shardline_broadcasts_total",
                "Operations sent to every shard",
            ),
            pruned_routes: Counter::new(
                "shardline_pruned_routes_total",
                "Operations narrowed to a subset of shards",
            ),
            backend_calls: Counter::new("shardline_backend_calls_total", "Backend calls issued"),
            backend_calls_by_shard: LabeledCounter::new(
                "shardline_shard_calls_total",
                "Backend calls issued per shard",
                "shard",
            ),
            backend_errors: Counter::new(
                "shardline_backend_errors_total",
                "Backend calls that failed",
            ),

            transactions_started: Counter::new(
                "shardline_transactions_started_total",
                "Atomic cross-shard rounds started",
            ),
            transactions_committed: Counter::new(
                "shardline_transactions_committed_total",
                "Atomic rounds committed",
            ),
            transactions_aborted: Counter::new(
                "shardline_transactions_aborted_total",
                "Atomic rounds rolled back",
            ),
            transactions_timed_out: Counter::new(
                "shardline_transactions_timed_out_total",
                "Atomic rounds aborted by the decision deadline",
            ),
            protocol_violations: Counter::new(
                "shardline_protocol_violations_total",
                "Unexpected decision messages received by workers",
            ),
            transactions_in_flight: Gauge::new(
                "shardline_transactions_in_flight",
                "Atomic rounds currently open",
            ),
        }
    }

    /// Record a routed scatter-gather operation.
    pub fn record_route(&self, decision: &RoutingDecision) {
        self.scatter_operations.inc();
        if decision.is_broadcast() {
            self.broadcasts.inc();
        } else {
            self.pruned_routes.inc();
        }
    }

    /// Record one backend call on `shard`.
    pub fn record_backend_call(&self, shard: &ShardId) {
        self.backend_calls.inc();
        self.backend_calls_by_shard.inc(&shard.to_string());
    }

    /// Record a failed backend call.
    pub fn record_backend_error(&self) {
        self.backend_errors.inc();
    }

    /// Record the outcome of an atomic round.
    pub fn record_transaction(&self, committed: bool, timed_out: bool) {
        if committed {
            self.transactions_committed.inc();
        } else {
            self.transactions_aborted.inc();
        }
        if timed_out {
            self.transactions_timed_out.inc();
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scatter_operations: self.scatter_operations.get(),
            broadcasts: self.broadcasts.get(),
            pruned_routes: self.pruned_routes.get(),
            backend_calls: self.backend_calls.get(),
            backend_errors: self.backend_errors.get(),
            transactions_started: self.transactions_started.get(),
            transactions_committed: self.transactions_committed.get(),
            transactions_aborted: self.transactions_aborted.get(),
            transactions_timed_out: self.transactions_timed_out.get(),
            protocol_violations: self.protocol_violations.get(),
            transactions_in_flight: self.transactions_in_flight.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.scatter_operations);
        add_metric!("counter", self.broadcasts);
        add_metric!("counter", self.pruned_routes);
        add_metric!("counter", self.backend_calls);
        add_metric!("counter", self.backend_errors);
        add_metric!("counter", self.transactions_started);
        add_metric!("counter", self.transactions_committed);
        add_metric!("counter", self.transactions_aborted);
        add_metric!("counter", self.transactions_timed_out);
        add_metric!("counter", self.protocol_violations);
        add_metric!("gauge", self.transactions_in_flight);

        let by_shard = &self.backend_calls_by_shard;
        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            by_shard.name(),
            by_shard.help(),
            by_shard.name()
        ));
        for (shard, count) in by_shard.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                by_shard.name(),
                by_shard.label(),
                shard,
                count
            ));
        }

        output
    }
}

impl Default for ShardingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`ShardingMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub scatter_operations: u64,
    pub broadcasts: u64,
    pub pruned_routes: u64,
    pub backend_calls: u64,
    pub backend_errors: u64,
    pub transactions_started: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    pub transactions_timed_out: u64,
    pub protocol_violations: u64,
    pub transactions_in_flight: i64,
}

impl MetricsSnapshot {
    /// Fraction of routed operations that avoided a broadcast.
    pub fn pruning_rate(&self) -> f64 {
        if self.scatter_operations == 0 {
            0.0
        } else {
            self.pruned_routes as f64 / self.scatter_operations as f64
        }
    }
}
