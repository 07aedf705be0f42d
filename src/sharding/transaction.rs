//! Atomic cross-shard rounds.
//!
//! A round applies one [`ShardOperation`] on every participating shard and
//! either commits it everywhere or rolls it back everywhere.
//!
//! # Protocol
//!
//! ```text
//!   Coordinator                          Worker (one task per shard)
//!   ───────────                          ───────────────────────────
//!   Collecting  ◄──── report ───────────  Running:  begin(), apply()
//!       │                                 Reported: scope held open
//!   Deciding        commit iff every
//!       │           report succeeded
//!   Broadcasting ──── decision ────────►  Committed: commit()
//!       │                                 Aborted:   rollback()
//!   Done
//! ```
//!
//! Workers communicate with the coordinator only through channels: one
//! shared report channel and a private oneshot decision channel each. A
//! worker never lets an error escape; it reports it and waits for the
//! decision. Anything other than a decision for its own round (a foreign
//! transaction id, a closed channel, a commit after its own failure) is a
//! protocol violation and the worker rolls back.
//!
//! Workers hold their shard-local scope, and any backend locks behind it,
//! until the decision arrives. `max_concurrent` bounds how many rounds can
//! do that at once: a round's permit is shared by its workers and released
//! only when the last of them exits, even if the coordinator already gave
//! up on them. `decision_timeout` bounds how long the coordinator waits for
//! reports before aborting.

use super::registry::ShardDescriptor;
use crate::backend::{BackendError, BackendResult, ShardBackend, ShardTransaction};
use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::metrics::{GaugeGuard, ShardingMetrics};
use crate::types::{MutationResult, Query, Row, ShardId};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// An operation applied inside each participating shard's local scope.
#[async_trait::async_trait]
pub trait ShardOperation: Send + Sync {
    /// Per-shard success payload.
    type Output: Send + 'static;

    /// Run the operation on one shard.
    ///
    /// Writes go through `txn` so they can be rolled back when another
    /// shard fails.
    async fn apply(
        &self,
        shard: &ShardId,
        txn: &mut dyn ShardTransaction,
    ) -> BackendResult<Self::Output>;
}

/// The global decision for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// Decision message sent from the coordinator to each worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionMessage {
    /// Round the decision belongs to.
    pub txn_id: Uuid,
    pub decision: Decision,
}

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Executing the operation inside the local scope.
    Running,
    /// Report sent; scope held open awaiting the decision.
    Reported,
    /// Local scope committed.
    Committed,
    /// Local scope rolled back.
    Aborted,
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Collecting,
    Deciding,
    Broadcasting,
    Done,
}

/// Why a shard did not succeed in a round.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The operation returned an error inside the local scope.
    #[error("operation failed: {0}")]
    Operation(BackendError),

    /// The local scope could not be opened.
    #[error("begin failed: {0}")]
    Begin(BackendError),

    /// The operation panicked.
    #[error("operation panicked")]
    Panicked,

    /// No report arrived before the decision deadline.
    #[error("no report before the decision deadline")]
    TimedOut,

    /// The worker went away without reporting.
    #[error("worker exited without reporting")]
    Lost,
}

/// A shard's success payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSuccess<T> {
    pub shard_id: ShardId,
    pub value: T,
}

/// A shard's failure in an aborted round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard_id: ShardId,
    pub reason: FailureReason,
}

/// The outcome of a round. Both lists follow participant order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome<T> {
    /// Every shard succeeded and committed.
    Committed(Vec<ShardSuccess<T>>),
    /// At least one shard failed; every shard rolled back. Shards that
    /// succeeded locally contribute nothing.
    Aborted(Vec<ShardFailure>),
}

impl<T> TransactionOutcome<T> {
    /// Whether the round committed.
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }

    /// Success payloads, empty when aborted.
    pub fn successes(&self) -> &[ShardSuccess<T>] {
        match self {
            TransactionOutcome::Committed(successes) => successes,
            TransactionOutcome::Aborted(_) => &[],
        }
    }

    /// Failure reasons, empty when committed.
    pub fn failures(&self) -> &[ShardFailure] {
        match self {
            TransactionOutcome::Committed(_) => &[],
            TransactionOutcome::Aborted(failures) => failures,
        }
    }
}

/// A worker's single report to the coordinator.
#[derive(Debug)]
pub struct WorkerReport<T> {
    pub shard_id: ShardId,
    pub result: std::result::Result<T, FailureReason>,
}

/// Per-shard, per-round worker state. Owned by its worker.
#[derive(Debug, Clone)]
pub struct TransactionSession {
    shard_id: ShardId,
    txn_id: Uuid,
    state: WorkerState,
    /// Local outcome, `None` until reported.
    succeeded: Option<bool>,
}

impl TransactionSession {
    /// A session in the `Running` state.
    pub fn new(shard_id: ShardId, txn_id: Uuid) -> Self {
        Self {
            shard_id,
            txn_id,
            state: WorkerState::Running,
            succeeded: None,
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn txn_id(&self) -> Uuid {
        self.txn_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Whether the local operation succeeded, once reported.
    pub fn succeeded(&self) -> Option<bool> {
        self.succeeded
    }

    /// Record the local outcome and move to `Reported`.
    pub fn report(&mut self, succeeded: bool) {
        self.succeeded = Some(succeeded);
        self.state = WorkerState::Reported;
    }

    /// Validate the received decision.
    ///
    /// `None` means the decision channel closed. Returns the decision to
    /// carry out, or a description of the protocol violation, in which
    /// case the session is already `Aborted`.
    pub fn resolve(
        &mut self,
        message: Option<DecisionMessage>,
    ) -> std::result::Result<Decision, String> {
        let violation = match message {
            None => "decision channel closed".to_string(),
            Some(msg) if msg.txn_id != self.txn_id => {
                format!("decision for foreign transaction {}", msg.txn_id)
            }
            Some(msg) if self.state != WorkerState::Reported => {
                format!("{:?} received before reporting", msg.decision)
            }
            Some(DecisionMessage {
                decision: Decision::Commit,
                ..
            }) if self.succeeded == Some(false) => "commit received after local failure".to_string(),
            Some(msg) => return Ok(msg.decision),
        };

        self.state = WorkerState::Aborted;
        Err(violation)
    }

    /// Record the terminal state.
    pub fn finish(&mut self, committed: bool) {
        self.state = if committed {
            WorkerState::Committed
        } else {
            WorkerState::Aborted
        };
    }
}

/// How a worker task ended.
#[derive(Debug)]
enum WorkerExit {
    Committed,
    RolledBack,
    CommitFailed(BackendError),
}

/// Runs atomic rounds over a set of participating shards.
#[derive(Debug)]
pub struct TransactionCoordinator {
    config: TransactionConfig,
    limiter: Option<Arc<Semaphore>>,
    metrics: Arc<ShardingMetrics>,
}

impl TransactionCoordinator {
    /// Create a coordinator.
    pub fn new(config: TransactionConfig, metrics: Arc<ShardingMetrics>) -> Self {
        let limiter = config.max_concurrent.map(|n| Arc::new(Semaphore::new(n)));
        Self {
            config,
            limiter,
            metrics,
        }
    }

    /// The coordinator configuration.
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Apply `op` atomically on every participant.
    ///
    /// Returns `Ok(Committed)` when every shard succeeded and committed,
    /// `Ok(Aborted)` when any shard failed or the decision deadline passed,
    /// and `Err(IncompleteCommit)` when a commit decision could not be
    /// finalized on some shard.
    pub async fn run<B, O>(
        &self,
        participants: Vec<ShardDescriptor<B>>,
        op: Arc<O>,
    ) -> Result<TransactionOutcome<O::Output>>
    where
        B: ShardBackend + ?Sized + 'static,
        O: ShardOperation + 'static,
    {
        if participants.is_empty() {
            return Ok(TransactionOutcome::Committed(Vec::new()));
        }

        let permit = match &self.limiter {
            Some(limiter) => Some(Arc::new(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("transaction limiter closed".to_string()))?,
            )),
            None => None,
        };
        let _in_flight = GaugeGuard::new(&self.metrics.transactions_in_flight);
        self.metrics.transactions_started.inc();

        let txn_id = Uuid::new_v4();
        let shard_ids: Vec<ShardId> = participants.iter().map(|s| s.id().clone()).collect();
        tracing::debug!(%txn_id, shards = ?shard_ids, "Starting atomic round");

        let (report_tx, mut report_rx) = mpsc::channel(participants.len());
        let mut decisions = Vec::with_capacity(participants.len());
        let mut handles: Vec<JoinHandle<WorkerExit>> = Vec::with_capacity(participants.len());

        for (index, shard) in participants.into_iter().enumerate() {
            let (decision_tx, decision_rx) = oneshot::channel();
            decisions.push(decision_tx);
            let worker = Worker {
                index,
                shard,
                txn_id,
                op: Arc::clone(&op),
                reports: report_tx.clone(),
                decision: decision_rx,
                metrics: Arc::clone(&self.metrics),
                permit: permit.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }
        drop(report_tx);

        // Collecting
        let mut phase = CoordinatorPhase::Collecting;
        let mut reports: Vec<Option<WorkerReport<O::Output>>> =
            (0..shard_ids.len()).map(|_| None).collect();
        let mut received = 0;
        let mut timed_out = false;
        let deadline = self.config.decision_timeout.map(|t| Instant::now() + t);

        while received < reports.len() {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, report_rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                },
                None => report_rx.recv().await,
            };
            let Some((index, report)) = next else {
                break;
            };
            if let Some(slot) = reports.get_mut(index) {
                if slot.is_none() {
                    received += 1;
                }
                *slot = Some(report);
            }
        }

        // Deciding
        advance(&mut phase, CoordinatorPhase::Deciding, txn_id);
        let commit = received == reports.len()
            && reports
                .iter()
                .all(|r| matches!(r, Some(WorkerReport { result: Ok(_), .. })));
        let decision = if commit {
            Decision::Commit
        } else {
            Decision::Abort
        };

        if timed_out {
            tracing::warn!(
                %txn_id,
                reported = received,
                participants = reports.len(),
                "Decision deadline passed, aborting"
            );
        }

        // Broadcasting
        advance(&mut phase, CoordinatorPhase::Broadcasting, txn_id);
        for decision_tx in decisions {
            // A worker that could not open its scope has already exited.
            let _ = decision_tx.send(DecisionMessage { txn_id, decision });
        }

        let outcome = if commit {
            let exits = join_all(handles).await;
            let incomplete: Vec<ShardId> = shard_ids
                .iter()
                .zip(exits)
                .filter_map(|(shard_id, exit)| match exit {
                    Ok(WorkerExit::Committed) => None,
                    Ok(WorkerExit::CommitFailed(err)) => {
                        tracing::error!(%txn_id, %shard_id, error = %err, "Commit failed to finalize");
                        Some(shard_id.clone())
                    }
                    Ok(WorkerExit::RolledBack) | Err(_) => {
                        tracing::error!(%txn_id, %shard_id, "Worker did not commit");
                        Some(shard_id.clone())
                    }
                })
                .collect();

            advance(&mut phase, CoordinatorPhase::Done, txn_id);
            if !incomplete.is_empty() {
                self.metrics.record_transaction(false, false);
                return Err(Error::IncompleteCommit { shards: incomplete });
            }

            let successes = reports
                .into_iter()
                .flatten()
                .filter_map(|report| match report.result {
                    Ok(value) => Some(ShardSuccess {
                        shard_id: report.shard_id,
                        value,
                    }),
                    Err(_) => None,
                })
                .collect();
            tracing::info!(%txn_id, ?decision, shards = shard_ids.len(), "Atomic round committed");
            TransactionOutcome::Committed(successes)
        } else {
            // Stalled workers are left to roll back once their
            // operation returns and they read the abort.
            if !timed_out {
                join_all(handles).await;
            }

            let missing = if timed_out {
                FailureReason::TimedOut
            } else {
                FailureReason::Lost
            };
            let failures: Vec<ShardFailure> = shard_ids
                .into_iter()
                .zip(reports)
                .filter_map(|(shard_id, report)| match report {
                    Some(WorkerReport { result: Ok(_), .. }) => None,
                    Some(WorkerReport {
                        result: Err(reason),
                        ..
                    }) => Some(ShardFailure { shard_id, reason }),
                    None => Some(ShardFailure {
                        shard_id,
                        reason: missing.clone(),
                    }),
                })
                .collect();

            advance(&mut phase, CoordinatorPhase::Done, txn_id);
            tracing::warn!(%txn_id, ?decision, failed = failures.len(), "Atomic round aborted");
            TransactionOutcome::Aborted(failures)
        };

        self.metrics
            .record_transaction(outcome.is_committed(), timed_out);
        Ok(outcome)
    }
}

fn advance(phase: &mut CoordinatorPhase, next: CoordinatorPhase, txn_id: Uuid) {
    tracing::trace!(%txn_id, from = ?*phase, to = ?next, "Coordinator phase");
    *phase = next;
}

/// One participant's side of a round.
struct Worker<B: ?Sized, O: ShardOperation> {
    index: usize,
    shard: ShardDescriptor<B>,
    txn_id: Uuid,
    op: Arc<O>,
    reports: mpsc::Sender<(usize, WorkerReport<O::Output>)>,
    decision: oneshot::Receiver<DecisionMessage>,
    metrics: Arc<ShardingMetrics>,
    /// The round's concurrency permit, if bounded. Held until the worker
    /// exits so a stalled scope keeps its round's slot.
    permit: Option<Arc<OwnedSemaphorePermit>>,
}

impl<B, O> Worker<B, O>
where
    B: ShardBackend + ?Sized,
    O: ShardOperation,
{
    async fn run(self) -> WorkerExit {
        let Worker {
            index,
            shard,
            txn_id,
            op,
            reports,
            decision,
            metrics,
            permit,
        } = self;
        let exit = run_worker(index, shard, txn_id, op, reports, decision, metrics).await;
        drop(permit);
        exit
    }
}

async fn run_worker<B, O>(
    index: usize,
    shard: ShardDescriptor<B>,
    txn_id: Uuid,
    op: Arc<O>,
    reports: mpsc::Sender<(usize, WorkerReport<O::Output>)>,
    decision: oneshot::Receiver<DecisionMessage>,
    metrics: Arc<ShardingMetrics>,
) -> WorkerExit
where
    B: ShardBackend + ?Sized,
    O: ShardOperation,
{
    let shard_id = shard.id().clone();
    let mut session = TransactionSession::new(shard_id.clone(), txn_id);

    let mut scope = match shard.backend().begin().await {
        Ok(scope) => scope,
        Err(err) => {
            tracing::debug!(%txn_id, %shard_id, error = %err, "Could not open shard scope");
            session.report(false);
            session.finish(false);
            let report = WorkerReport {
                shard_id,
                result: Err(FailureReason::Begin(err)),
            };
            let _ = reports.send((index, report)).await;
            return WorkerExit::RolledBack;
        }
    };

    let applied = AssertUnwindSafe(op.apply(&shard_id, &mut *scope))
        .catch_unwind()
        .await;
    let result = match applied {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FailureReason::Operation(err)),
        Err(_) => Err(FailureReason::Panicked),
    };
    if let Err(reason) = &result {
        tracing::debug!(%txn_id, %shard_id, %reason, "Shard operation failed");
    }

    session.report(result.is_ok());
    let report = WorkerReport {
        shard_id: shard_id.clone(),
        result,
    };
    // A closed report channel surfaces below as a closed decision channel.
    let _ = reports.send((index, report)).await;
    drop(reports);

    let message = decision.await.ok();
    match session.resolve(message) {
        Ok(Decision::Commit) => match scope.commit().await {
            Ok(()) => {
                session.finish(true);
                WorkerExit::Committed
            }
            Err(err) => {
                session.finish(false);
                WorkerExit::CommitFailed(err)
            }
        },
        Ok(Decision::Abort) => {
            rollback(&mut *scope, &shard_id, txn_id).await;
            session.finish(false);
            WorkerExit::RolledBack
        }
        Err(violation) => {
            metrics.protocol_violations.inc();
            tracing::error!(%txn_id, %shard_id, %violation, "Protocol violation, rolling back");
            rollback(&mut *scope, &shard_id, txn_id).await;
            WorkerExit::RolledBack
        }
    }
}

async fn rollback(scope: &mut dyn ShardTransaction, shard_id: &ShardId, txn_id: Uuid) {
    if let Err(err) = scope.rollback().await {
        tracing::error!(%txn_id, %shard_id, error = %err, "Rollback failed");
    }
}

/// Applies `changes` to every row matching a query, on each shard.
#[derive(Debug, Clone)]
pub struct UpdateMatching {
    pub query: Query,
    pub changes: Row,
}

#[async_trait::async_trait]
impl ShardOperation for UpdateMatching {
    type Output = MutationResult;

    async fn apply(
        &self,
        _shard: &ShardId,
        txn: &mut dyn ShardTransaction,
    ) -> BackendResult<MutationResult> {
        txn.update_all(&self.query, &self.changes).await
    }
}

/// Deletes every row matching a query, on each shard.
#[derive(Debug, Clone)]
pub struct DeleteMatching {
    pub query: Query,
}

#[async_trait::async_trait]
impl ShardOperation for DeleteMatching {
    type Output = MutationResult;

    async fn apply(
        &self,
        _shard: &ShardId,
        txn: &mut dyn ShardTransaction,
    ) -> BackendResult<MutationResult> {
        txn.delete_all(&self.query).await
    }
}
