//! In-memory shard backend for tests and demos.
//!
//! Every call is recorded in a per-backend call log so tests can assert
//! exactly which shards were contacted. Transactional writes are staged on
//! a snapshot of the tables and only become visible on commit. Failures
//! can be injected for the next ordinary call, for every transactional
//! write, or for opening and committing scopes. Transactional calls can be
//! made to hang until released.

use crate::backend::{BackendError, BackendResult, ShardBackend, ShardTransaction};
use crate::sharding::matches_all;
use crate::types::{AggregateKind, MutationResult, Query, Row, Value};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A backend call, as recorded in the call log.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Read { source: String },
    GetOne { source: String, id: Value },
    Exists { source: String },
    Aggregate { source: String, kind: AggregateKind },
    Insert { source: String },
    InsertAll { source: String, rows: usize },
    Update { source: String },
    Delete { source: String },
    UpdateAll { source: String },
    DeleteAll { source: String },
    Begin,
}

type Tables = HashMap<String, Vec<Row>>;

#[derive(Debug)]
struct MemoryState {
    name: String,
    primary_key: String,
    tables: Mutex<Tables>,
    calls: Mutex<Vec<BackendCall>>,
    fail_next: Mutex<Option<BackendError>>,
    txn_failure: Mutex<Option<BackendError>>,
    begin_failure: Mutex<Option<BackendError>>,
    commit_failure: Mutex<Option<BackendError>>,
    hang: AtomicBool,
    begin_panics: AtomicBool,
    opened: AtomicU64,
    commits: AtomicU64,
    failed_commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl MemoryState {
    fn record(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }

    /// Consume a pending injected failure.
    fn check(&self) -> BackendResult<()> {
        match self.fail_next.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// An in-memory [`ShardBackend`]. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryState>,
}

impl MemoryBackend {
    /// Create an empty backend whose primary key column is `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_primary_key(name, "id")
    }

    /// Create an empty backend with a custom primary key column.
    pub fn with_primary_key(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryState {
                name: name.into(),
                primary_key: primary_key.into(),
                tables: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(None),
                txn_failure: Mutex::new(None),
                begin_failure: Mutex::new(None),
                commit_failure: Mutex::new(None),
                hang: AtomicBool::new(false),
                begin_panics: AtomicBool::new(false),
                opened: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                failed_commits: AtomicU64::new(0),
                rollbacks: AtomicU64::new(0),
            }),
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Insert rows directly, bypassing the call log.
    pub fn seed(&self, source: &str, rows: impl IntoIterator<Item = Row>) {
        self.inner
            .tables
            .lock()
            .entry(source.to_string())
            .or_default()
            .extend(rows);
    }

    /// Committed rows of a source.
    pub fn rows(&self, source: &str) -> Vec<Row> {
        self.inner
            .tables
            .lock()
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.calls.lock().clone()
    }

    /// Number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Fail the next ordinary (non-transactional) call with `err`.
    pub fn fail_next(&self, err: BackendError) {
        *self.inner.fail_next.lock() = Some(err);
    }

    /// Fail every write made inside a transactional scope with `err`.
    pub fn fail_transactions_with(&self, err: BackendError) {
        *self.inner.txn_failure.lock() = Some(err);
    }

    /// Fail every attempt to open a transactional scope with `err`.
    pub fn fail_begin_with(&self, err: BackendError) {
        *self.inner.begin_failure.lock() = Some(err);
    }

    /// Fail every commit with `err`. The scope's writes are discarded.
    pub fn fail_commit_with(&self, err: BackendError) {
        *self.inner.commit_failure.lock() = Some(err);
    }

    /// Make every attempt to open a transactional scope panic.
    pub fn panic_on_begin(&self) {
        self.inner.begin_panics.store(true, Ordering::SeqCst);
    }

    /// Make every call inside a transactional scope hang until
    /// [`release_transactions`](Self::release_transactions).
    pub fn hang_transactions(&self) {
        self.inner.hang.store(true, Ordering::SeqCst);
    }

    /// Let hung transactional calls proceed.
    pub fn release_transactions(&self) {
        self.inner.hang.store(false, Ordering::SeqCst);
    }

    /// Scopes opened and not yet committed or rolled back.
    pub fn open_scopes(&self) -> u64 {
        let opened = self.inner.opened.load(Ordering::SeqCst);
        opened.saturating_sub(self.commits() + self.rollbacks() + self.failed_commits())
    }

    /// Number of commits that failed.
    pub fn failed_commits(&self) -> u64 {
        self.inner.failed_commits.load(Ordering::SeqCst)
    }

    /// Number of committed scopes.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Number of rolled back scopes.
    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    fn primary_key_matches(&self, row: &Row, entity: &Row) -> bool {
        let key = &self.inner.primary_key;
        matches!((row.get(key), entity.get(key)), (Some(a), Some(b)) if a == b)
    }
}

#[async_trait::async_trait]
impl ShardBackend for MemoryBackend {
    async fn read(&self, query: &Query) -> BackendResult<Vec<Row>> {
        self.inner.record(BackendCall::Read {
            source: query.source.clone(),
        });
        self.inner.check()?;
        Ok(select(&self.inner.tables.lock(), query))
    }

    async fn get_one(&self, query: &Query, id: &Value) -> BackendResult<Option<Row>> {
        self.inner.record(BackendCall::GetOne {
            source: query.source.clone(),
            id: id.clone(),
        });
        self.inner.check()?;
        let key = &self.inner.primary_key;
        Ok(select(&self.inner.tables.lock(), query)
            .into_iter()
            .find(|row| row.get(key) == Some(id)))
    }

    async fn exists(&self, query: &Query) -> BackendResult<bool> {
        self.inner.record(BackendCall::Exists {
            source: query.source.clone(),
        });
        self.inner.check()?;
        Ok(!select(&self.inner.tables.lock(), query).is_empty())
    }

    async fn aggregate(
        &self,
        query: &Query,
        kind: AggregateKind,
        field: Option<&str>,
    ) -> BackendResult<Option<Value>> {
        self.inner.record(BackendCall::Aggregate {
            source: query.source.clone(),
            kind,
        });
        self.inner.check()?;
        let rows = select(&self.inner.tables.lock(), query);
        aggregate(&rows, kind, field)
    }

    async fn insert(&self, source: &str, row: Row) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::Insert {
            source: source.to_string(),
        });
        self.inner.check()?;
        Ok(insert_rows(&mut self.inner.tables.lock(), source, vec![row]))
    }

    async fn insert_all(&self, source: &str, rows: Vec<Row>) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::InsertAll {
            source: source.to_string(),
            rows: rows.len(),
        });
        self.inner.check()?;
        Ok(insert_rows(&mut self.inner.tables.lock(), source, rows))
    }

    async fn update(&self, source: &str, entity: Row) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::Update {
            source: source.to_string(),
        });
        self.inner.check()?;
        let mut tables = self.inner.tables.lock();
        let table = tables.entry(source.to_string()).or_default();
        match table.iter_mut().find(|row| self.primary_key_matches(row, &entity)) {
            Some(row) => {
                row.apply(&entity);
                Ok(MutationResult::with_rows(1, vec![row.clone()]))
            }
            None => Ok(MutationResult::count(0)),
        }
    }

    async fn delete(&self, source: &str, entity: Row) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::Delete {
            source: source.to_string(),
        });
        self.inner.check()?;
        let mut tables = self.inner.tables.lock();
        let table = tables.entry(source.to_string()).or_default();
        match table.iter().position(|row| self.primary_key_matches(row, &entity)) {
            Some(pos) => {
                let removed = table.remove(pos);
                Ok(MutationResult::with_rows(1, vec![removed]))
            }
            None => Ok(MutationResult::count(0)),
        }
    }

    async fn update_all(&self, query: &Query, changes: &Row) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::UpdateAll {
            source: query.source.clone(),
        });
        self.inner.check()?;
        Ok(update_rows(&mut self.inner.tables.lock(), query, changes))
    }

    async fn delete_all(&self, query: &Query) -> BackendResult<MutationResult> {
        self.inner.record(BackendCall::DeleteAll {
            source: query.source.clone(),
        });
        self.inner.check()?;
        Ok(delete_rows(&mut self.inner.tables.lock(), query))
    }

    async fn begin(&self) -> BackendResult<Box<dyn ShardTransaction>> {
        self.inner.record(BackendCall::Begin);
        if self.inner.begin_panics.load(Ordering::SeqCst) {
            panic!("{}: begin panicked", self.inner.name);
        }
        if let Some(err) = self.inner.begin_failure.lock().clone() {
            return Err(err);
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        let staged = self.inner.tables.lock().clone();
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.inner),
            staged,
            finished: false,
        }))
    }
}

/// A transactional scope over a snapshot of the backend's tables.
///
/// Commit replaces the backend's tables with the snapshot, so concurrent
/// scopes on the same backend are last-commit-wins.
struct MemoryTransaction {
    state: Arc<MemoryState>,
    staged: Tables,
    finished: bool,
}

impl MemoryTransaction {
    async fn enter(&self) -> BackendResult<()> {
        if self.finished {
            return Err(BackendError::Other("transaction already finished".to_string()));
        }
        while self.state.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn check_write(&self) -> BackendResult<()> {
        match self.state.txn_failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ShardTransaction for MemoryTransaction {
    async fn read(&mut self, query: &Query) -> BackendResult<Vec<Row>> {
        self.enter().await?;
        Ok(select(&self.staged, query))
    }

    async fn insert_all(&mut self, source: &str, rows: Vec<Row>) -> BackendResult<MutationResult> {
        self.enter().await?;
        self.check_write()?;
        Ok(insert_rows(&mut self.staged, source, rows))
    }

    async fn update_all(&mut self, query: &Query, changes: &Row) -> BackendResult<MutationResult> {
        self.enter().await?;
        self.check_write()?;
        Ok(update_rows(&mut self.staged, query, changes))
    }

    async fn delete_all(&mut self, query: &Query) -> BackendResult<MutationResult> {
        self.enter().await?;
        self.check_write()?;
        Ok(delete_rows(&mut self.staged, query))
    }

    async fn commit(&mut self) -> BackendResult<()> {
        if self.finished {
            return Err(BackendError::Other("transaction already finished".to_string()));
        }
        self.finished = true;
        if let Some(err) = self.state.commit_failure.lock().clone() {
            self.staged.clear();
            self.state.failed_commits.fetch_add(1, Ordering::SeqCst);
            return Err(err);
        }
        *self.state.tables.lock() = std::mem::take(&mut self.staged);
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> BackendResult<()> {
        if self.finished {
            return Err(BackendError::Other("transaction already finished".to_string()));
        }
        self.finished = true;
        self.staged.clear();
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn select(tables: &Tables, query: &Query) -> Vec<Row> {
    tables
        .get(&query.source)
        .map(|rows| {
            rows.iter()
                .filter(|row| matches_all(&query.filters, row))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

fn insert_rows(tables: &mut Tables, source: &str, rows: Vec<Row>) -> MutationResult {
    let count = rows.len() as u64;
    tables
        .entry(source.to_string())
        .or_default()
        .extend(rows.iter().cloned());
    MutationResult::with_rows(count, rows)
}

fn update_rows(tables: &mut Tables, query: &Query, changes: &Row) -> MutationResult {
    let mut count = 0;
    if let Some(rows) = tables.get_mut(&query.source) {
        for row in rows.iter_mut().filter(|row| matches_all(&query.filters, row)) {
            row.apply(changes);
            count += 1;
        }
    }
    MutationResult::count(count)
}

fn delete_rows(tables: &mut Tables, query: &Query) -> MutationResult {
    let Some(rows) = tables.get_mut(&query.source) else {
        return MutationResult::count(0);
    };
    let before = rows.len();
    rows.retain(|row| !matches_all(&query.filters, row));
    MutationResult::count((before - rows.len()) as u64)
}

fn aggregate(rows: &[Row], kind: AggregateKind, field: Option<&str>) -> BackendResult<Option<Value>> {
    let values: Vec<&Value> = match field {
        Some(field) => rows
            .iter()
            .filter_map(|row| row.get(field))
            .filter(|v| !v.is_null())
            .collect(),
        None => Vec::new(),
    };

    match kind {
        AggregateKind::Count => {
            let n = if field.is_some() { values.len() } else { rows.len() };
            Ok(Some(Value::Int(n as i64)))
        }
        AggregateKind::Sum | AggregateKind::Avg => {
            let field = field.ok_or_else(|| BackendError::Rejected(format!("{} requires a field", kind)))?;
            let numbers = values
                .iter()
                .map(|v| {
                    v.to_decimal()
                        .ok_or_else(|| BackendError::Rejected(format!("{} is not numeric", field)))
                })
                .collect::<BackendResult<Vec<Decimal>>>()?;
            if numbers.is_empty() {
                return Ok(None);
            }
            let sum: Decimal = numbers.iter().sum();
            if kind == AggregateKind::Sum {
                Ok(Some(Value::Decimal(sum)))
            } else {
                Ok(Some(Value::Decimal(sum / Decimal::from(numbers.len() as u64))))
            }
        }
        AggregateKind::Min | AggregateKind::Max => {
            let wanted = if kind == AggregateKind::Min {
                CmpOrdering::Less
            } else {
                CmpOrdering::Greater
            };
            Ok(values
                .into_iter()
                .fold(None::<&Value>, |best, v| match best {
                    Some(b) if v.compare(b) != Some(wanted) => Some(b),
                    _ => Some(v),
                })
                .cloned())
        }
    }
}
