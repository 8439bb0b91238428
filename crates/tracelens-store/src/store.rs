//! High-level transactional `TraceStore` API.
//!
//! Composes the repositories into thread-centric operations. Every write
//! runs inside one `IMMEDIATE` transaction, so readers never observe a
//! partially written checkpoint or fork.
//!
//! INVARIANT: writes to a thread are serialized through an in-process lock
//! per thread id. Forks additionally take a global lock because they create
//! a thread and check branch-name uniqueness. `UNIQUE(thread_id, sequence)`
//! backs the ordering at the database level.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracelens_core::span::duration_secs;
use tracelens_core::thread::ThreadSummary;
use tracelens_core::{
    Checkpoint, CheckpointId, Metadata, NewSpan, Span, SpanClose, SpanId, SpanStatus, State,
    StateSummary, ThreadId,
};
use tracelens_settings::DatabaseSettings;
use tracelens_telemetry::metrics;
use tracing::{debug, instrument, warn};

use crate::connection::{self, ConnectionConfig, ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::repositories::{CheckpointRepo, InsertCheckpoint, SpanRepo, ThreadRepo, ThreadTail};
use crate::row_helpers::truncate_micros;

/// A new checkpoint for [`TraceStore::put_checkpoint`].
#[derive(Clone, Debug, Default)]
pub struct PutCheckpoint {
    pub state: State,
    /// May name a checkpoint in another thread only when seeding an empty
    /// thread or when that thread is an ancestor of this one.
    pub parent_checkpoint_id: Option<CheckpointId>,
    pub metadata: Metadata,
    /// A repeated put with the same key returns the first checkpoint.
    pub idempotency_key: Option<String>,
}

impl PutCheckpoint {
    pub fn new(state: State) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: CheckpointId) -> Self {
        self.parent_checkpoint_id = Some(parent);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Seed a new thread from an existing checkpoint.
#[derive(Clone, Debug)]
pub struct ForkRequest<'a> {
    pub source_thread_id: &'a ThreadId,
    pub source_checkpoint_id: &'a CheckpointId,
    /// Must not own any checkpoint or span yet.
    pub target_thread_id: &'a ThreadId,
    /// Replaces the source state when set.
    pub state: Option<State>,
    pub metadata: Metadata,
    /// Unique among branches of the source thread.
    pub branch_name: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

/// Result of a checkpoint write.
#[derive(Clone, Debug, PartialEq)]
pub struct Written {
    pub checkpoint: Checkpoint,
    /// The idempotency key matched an earlier write; nothing was stored.
    pub replayed: bool,
}

impl Written {
    fn fresh(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            replayed: false,
        }
    }

    fn replay(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint,
            replayed: true,
        }
    }
}

/// Checkpoints and spans of one thread, read in a single transaction.
#[derive(Clone, Debug, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    pub checkpoints: Vec<Checkpoint>,
    pub spans: Vec<Span>,
}

impl ThreadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty() && self.spans.is_empty()
    }
}

/// Time budget of one store operation.
struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    fn expired(&self) -> StoreError {
        StoreError::Timeout(self.budget)
    }
}

pub struct TraceStore {
    pool: ConnectionPool,
    path: PathBuf,
    operation_timeout: Duration,
    global_write_lock: Mutex<()>,
    thread_write_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl TraceStore {
    pub fn new(pool: ConnectionPool, path: PathBuf, operation_timeout: Duration) -> Self {
        Self {
            pool,
            path,
            operation_timeout,
            global_write_lock: Mutex::new(()),
            thread_write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the database named by `settings`, creating it if needed.
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        let config = ConnectionConfig::from_settings(settings);
        let pool = connection::open_file(&settings.path, &config)?;
        Ok(Self::new(
            pool,
            settings.path.clone(),
            Duration::from_millis(settings.operation_timeout_ms.max(1)),
        ))
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(&DatabaseSettings {
            path: path.to_owned(),
            ..DatabaseSettings::default()
        })
    }

    /// Single-connection in-memory store (for tests).
    pub fn in_memory() -> Result<Self> {
        let config = ConnectionConfig::default();
        let pool = connection::open_in_memory(&config)?;
        Ok(Self::new(pool, connection::memory_path(), config.connection_timeout))
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn acquire_thread_write_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.thread_write_locks.lock();

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(thread_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(thread_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    fn with_thread_write_lock<T>(
        &self,
        thread_id: &str,
        f: impl FnMut(&Deadline) -> Result<T>,
    ) -> Result<T> {
        let deadline = Deadline::start(self.operation_timeout);
        let thread_lock = self.acquire_thread_write_lock(thread_id);
        let _guard = thread_lock
            .try_lock_for(deadline.remaining())
            .ok_or_else(|| deadline.expired())?;
        self.retry_on_sqlite_busy(&deadline, f)
    }

    /// Global lock first, then the target thread's lock. Plain writes only
    /// ever take a thread lock, so the order cannot invert.
    fn with_fork_write_lock<T>(
        &self,
        target_thread_id: &str,
        f: impl FnMut(&Deadline) -> Result<T>,
    ) -> Result<T> {
        let deadline = Deadline::start(self.operation_timeout);
        let _global = self
            .global_write_lock
            .try_lock_for(deadline.remaining())
            .ok_or_else(|| deadline.expired())?;
        let thread_lock = self.acquire_thread_write_lock(target_thread_id);
        let _guard = thread_lock
            .try_lock_for(deadline.remaining())
            .ok_or_else(|| deadline.expired())?;
        self.retry_on_sqlite_busy(&deadline, f)
    }

    /// Run `f` inside one read transaction so multi-query reads see a
    /// single snapshot.
    fn read<T>(&self, mut f: impl FnMut(&Connection) -> Result<T>) -> Result<T> {
        let deadline = Deadline::start(self.operation_timeout);
        self.retry_on_sqlite_busy(&deadline, |deadline| {
            let conn = self.conn(deadline)?;
            let tx = conn.unchecked_transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Retry on `SQLite` BUSY/LOCKED with linear backoff and jitter until
    /// the deadline runs out.
    ///
    /// Backoff: base = min(attempts * 10, 500) ms, jitter ±25%.
    fn retry_on_sqlite_busy<T>(
        &self,
        deadline: &Deadline,
        mut f: impl FnMut(&Deadline) -> Result<T>,
    ) -> Result<T> {
        let mut attempts: u32 = 0;

        loop {
            match f(deadline) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy_or_locked() => {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff = Duration::from_millis(base_ms.saturating_sub(jitter_range) + jitter);
                    if deadline.remaining() <= backoff {
                        warn!(attempts, budget = ?deadline.budget, "database stayed busy past the operation budget");
                        return Err(deadline.expired());
                    }
                    metrics::store_busy_retry();
                    std::thread::sleep(backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn conn(&self, deadline: &Deadline) -> Result<PooledConnection> {
        self.pool
            .get_timeout(deadline.remaining())
            .map_err(|_| deadline.expired())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Checkpoints
    // ─────────────────────────────────────────────────────────────────────

    /// Append a checkpoint to `thread_id`. The store assigns the id, the
    /// next sequence number and a `created_at` no earlier than the thread's
    /// latest checkpoint.
    pub fn put_checkpoint(&self, thread_id: &ThreadId, put: PutCheckpoint) -> Result<Checkpoint> {
        self.write_checkpoint(thread_id, put).map(|w| w.checkpoint)
    }

    /// [`put_checkpoint`](Self::put_checkpoint) that also reports whether
    /// an idempotency key replayed an earlier write.
    #[instrument(skip(self, put), fields(thread_id = %thread_id))]
    pub fn write_checkpoint(&self, thread_id: &ThreadId, put: PutCheckpoint) -> Result<Written> {
        let PutCheckpoint {
            state,
            parent_checkpoint_id,
            metadata,
            idempotency_key,
        } = put;
        let mut checkpoint = Checkpoint {
            checkpoint_id: CheckpointId::new(),
            thread_id: thread_id.clone(),
            parent_checkpoint_id,
            sequence: 0,
            created_at: truncate_micros(Utc::now()),
            state_summary: StateSummary::from_state(&state),
            state,
            metadata,
        };

        let existing = self.with_thread_write_lock(thread_id.as_str(), |deadline| {
            let mut conn = self.conn(deadline)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(key) = idempotency_key.as_deref() {
                if let Some(existing) = CheckpointRepo::get_by_idempotency_key(&tx, key)? {
                    if existing.thread_id != *thread_id {
                        return Err(StoreError::Conflict(format!(
                            "idempotency key {key:?} already used in thread {}",
                            existing.thread_id
                        )));
                    }
                    return Ok(Some(existing));
                }
            }

            if let Some(parent_id) = &checkpoint.parent_checkpoint_id {
                let parent = CheckpointRepo::get_link(&tx, parent_id.as_str())?
                    .ok_or_else(|| StoreError::not_found("checkpoint", parent_id.as_str()))?;
                if parent.thread_id != thread_id.as_str() {
                    check_cross_thread_parent(&tx, thread_id.as_str(), &parent.thread_id)?;
                }
            }

            let tail = CheckpointRepo::tail(&tx, thread_id.as_str())?;
            let (sequence, created_at) = next_position(tail.as_ref(), truncate_micros(Utc::now()));
            checkpoint.checkpoint_id = CheckpointId::new();
            checkpoint.sequence = sequence;
            checkpoint.created_at = created_at;

            CheckpointRepo::insert(
                &tx,
                &checkpoint,
                &InsertCheckpoint {
                    idempotency_key: idempotency_key.as_deref(),
                    ..InsertCheckpoint::default()
                },
            )?;
            tx.commit()?;
            Ok(None)
        })?;

        if let Some(existing) = existing {
            debug!(checkpoint_id = %existing.checkpoint_id, "idempotent put returned existing checkpoint");
            return Ok(Written::replay(existing));
        }

        metrics::checkpoint_written();
        debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            sequence = checkpoint.sequence,
            "checkpoint written"
        );
        Ok(Written::fresh(checkpoint))
    }

    /// Fails with `NotFound` if the checkpoint is absent or belongs to a
    /// different thread.
    pub fn get_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint> {
        self.read(|conn| checkpoint_in_thread(conn, thread_id, checkpoint_id))
    }

    /// Checkpoints of a thread ordered by `created_at`, ties broken by id.
    pub fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        self.read(|conn| CheckpointRepo::list_by_thread(conn, thread_id.as_str()))
    }

    pub fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>> {
        self.read(|conn| CheckpointRepo::latest(conn, thread_id.as_str()))
    }

    /// Chain from the thread's earliest reachable ancestor to its latest
    /// checkpoint, following parent links within the thread only. A thread
    /// with more than one root has no single chain; its history is every
    /// checkpoint in creation order.
    pub fn history(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        let checkpoints = self.list_checkpoints(thread_id)?;
        Ok(history_chain(checkpoints))
    }

    /// Ancestors of a checkpoint across thread boundaries, root first and
    /// ending with the checkpoint itself.
    pub fn lineage(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<Checkpoint>> {
        self.read(|conn| {
            let start = checkpoint_in_thread(conn, thread_id, checkpoint_id)?;
            let mut seen = HashSet::from([start.checkpoint_id.clone()]);
            let mut parent_id = start.parent_checkpoint_id.clone();
            let mut chain = vec![start];

            while let Some(id) = parent_id {
                let Some(parent) = CheckpointRepo::get_by_id(conn, id.as_str())? else {
                    break;
                };
                if !seen.insert(parent.checkpoint_id.clone()) {
                    warn!(checkpoint_id = %parent.checkpoint_id, "cycle in checkpoint parents");
                    break;
                }
                parent_id = parent.parent_checkpoint_id.clone();
                chain.push(parent);
            }

            chain.reverse();
            Ok(chain)
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Spans
    // ─────────────────────────────────────────────────────────────────────

    /// Record the start of a span. Its parent need not be known yet;
    /// exporters deliver spans out of order.
    #[instrument(skip(self, new), fields(thread_id = %thread_id, name = %new.name))]
    pub fn open_span(&self, thread_id: &ThreadId, new: NewSpan) -> Result<Span> {
        let span = span_from_new(thread_id, new);
        self.with_thread_write_lock(thread_id.as_str(), |deadline| {
            let conn = self.conn(deadline)?;
            SpanRepo::insert(&conn, &span)
        })?;
        metrics::span_opened();
        debug!(span_id = %span.span_id, "span opened");
        Ok(span)
    }

    /// Close an open span. Closing twice, or with an end before the start,
    /// is `InvalidState`.
    #[instrument(skip(self, close), fields(span_id = %span_id))]
    pub fn close_span(&self, span_id: &SpanId, close: SpanClose) -> Result<Span> {
        let thread_id = self
            .read(|conn| SpanRepo::thread_of(conn, span_id.as_str()))?
            .ok_or_else(|| StoreError::not_found("span", span_id.as_str()))?;
        let end_time = truncate_micros(close.end_time);

        let span = self.with_thread_write_lock(thread_id.as_str(), |deadline| {
            let mut conn = self.conn(deadline)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut span = SpanRepo::get_by_id(&tx, span_id.as_str())?
                .ok_or_else(|| StoreError::not_found("span", span_id.as_str()))?;
            if !span.is_open() {
                return Err(StoreError::InvalidState(format!(
                    "span {span_id} is already closed"
                )));
            }
            check_span_bounds(span_id, span.start_time, end_time)?;

            if let Some(patch) = &close.attributes_patch {
                for (key, value) in patch {
                    span.attributes.insert(key.clone(), value.clone());
                }
            }
            SpanRepo::close(&tx, span_id.as_str(), end_time, close.status, &span.attributes)?;
            tx.commit()?;

            span.end_time = Some(end_time);
            span.duration = Some(duration_secs(span.start_time, end_time));
            span.status = close.status;
            Ok(span)
        })?;

        metrics::span_closed(span.status.as_str());
        debug!(status = %span.status, "span closed");
        Ok(span)
    }

    /// Record a span whose start and end are both already known.
    #[instrument(skip(self, new, close), fields(thread_id = %thread_id, name = %new.name))]
    pub fn record_span(&self, thread_id: &ThreadId, new: NewSpan, close: SpanClose) -> Result<Span> {
        let mut span = span_from_new(thread_id, new);
        let end_time = truncate_micros(close.end_time);
        check_span_bounds(&span.span_id, span.start_time, end_time)?;
        if let Some(patch) = close.attributes_patch {
            span.attributes.extend(patch);
        }
        span.end_time = Some(end_time);
        span.duration = Some(duration_secs(span.start_time, end_time));
        span.status = close.status;

        self.with_thread_write_lock(thread_id.as_str(), |deadline| {
            let conn = self.conn(deadline)?;
            SpanRepo::insert(&conn, &span)
        })?;
        metrics::span_opened();
        metrics::span_closed(span.status.as_str());
        Ok(span)
    }

    pub fn get_span(&self, span_id: &SpanId) -> Result<Span> {
        self.read(|conn| SpanRepo::get_by_id(conn, span_id.as_str()))?
            .ok_or_else(|| StoreError::not_found("span", span_id.as_str()))
    }

    /// Spans of a thread ordered by `start_time`, ties broken by id.
    pub fn list_spans(&self, thread_id: &ThreadId) -> Result<Vec<Span>> {
        self.read(|conn| SpanRepo::list_by_thread(conn, thread_id.as_str()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Threads
    // ─────────────────────────────────────────────────────────────────────

    /// All threads, most recently updated first.
    pub fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.read(ThreadRepo::list_summaries)
    }

    pub fn thread_exists(&self, thread_id: &ThreadId) -> Result<bool> {
        self.read(|conn| ThreadRepo::exists(conn, thread_id.as_str()))
    }

    pub fn snapshot(&self, thread_id: &ThreadId) -> Result<ThreadSnapshot> {
        self.read(|conn| {
            Ok(ThreadSnapshot {
                thread_id: thread_id.clone(),
                checkpoints: CheckpointRepo::list_by_thread(conn, thread_id.as_str())?,
                spans: SpanRepo::list_by_thread(conn, thread_id.as_str())?,
            })
        })
    }

    /// Create `target_thread_id` with one checkpoint whose parent is the
    /// source checkpoint. Validation of the source, the branch name and the
    /// target thread happens in the same transaction as the insert.
    ///
    /// A reused idempotency key replays the earlier seed only when that seed
    /// was forked the same way from the same source checkpoint; any other
    /// use of the key is a `Conflict`.
    #[instrument(skip(self, req), fields(
        source_thread_id = %req.source_thread_id,
        source_checkpoint_id = %req.source_checkpoint_id,
        target_thread_id = %req.target_thread_id
    ))]
    pub fn fork(&self, req: ForkRequest<'_>) -> Result<Written> {
        let written = self.with_fork_write_lock(req.target_thread_id.as_str(), |deadline| {
            let mut conn = self.conn(deadline)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(key) = req.idempotency_key {
                if let Some(existing) = CheckpointRepo::get_by_idempotency_key(&tx, key)? {
                    check_fork_replay(&tx, &req, key, &existing)?;
                    return Ok(Written::replay(existing));
                }
            }

            let source = checkpoint_in_thread(&tx, req.source_thread_id, req.source_checkpoint_id)?;

            if let Some(name) = req.branch_name {
                if CheckpointRepo::branch_name_taken(&tx, req.source_thread_id.as_str(), name)? {
                    return Err(StoreError::Conflict(format!(
                        "branch {name:?} already exists for thread {}",
                        req.source_thread_id
                    )));
                }
            }
            if ThreadRepo::exists(&tx, req.target_thread_id.as_str())? {
                return Err(StoreError::Conflict(format!(
                    "thread {} already exists",
                    req.target_thread_id
                )));
            }

            let state = req.state.clone().unwrap_or(source.state);
            let checkpoint = Checkpoint {
                checkpoint_id: CheckpointId::new(),
                thread_id: req.target_thread_id.clone(),
                parent_checkpoint_id: Some(source.checkpoint_id),
                sequence: 0,
                created_at: truncate_micros(Utc::now()),
                state_summary: StateSummary::from_state(&state),
                state,
                metadata: req.metadata.clone(),
            };
            CheckpointRepo::insert(
                &tx,
                &checkpoint,
                &InsertCheckpoint {
                    origin_thread_id: Some(req.source_thread_id.as_str()),
                    branch_name: req.branch_name,
                    idempotency_key: req.idempotency_key,
                },
            )?;
            tx.commit()?;
            metrics::checkpoint_written();
            Ok(Written::fresh(checkpoint))
        })?;

        if written.replayed {
            debug!(checkpoint_id = %written.checkpoint.checkpoint_id, "idempotent fork returned existing seed");
        } else {
            debug!(checkpoint_id = %written.checkpoint.checkpoint_id, "thread forked");
        }
        Ok(written)
    }
}

/// The keyed checkpoint must be a seed of the same kind (resume or branch)
/// forked from the requested source checkpoint.
fn check_fork_replay(
    conn: &Connection,
    req: &ForkRequest<'_>,
    key: &str,
    existing: &Checkpoint,
) -> Result<()> {
    let origin = CheckpointRepo::fork_origin(conn, existing.checkpoint_id.as_str())?;
    let same_source = origin
        .as_ref()
        .and_then(|o| o.origin_thread_id.as_deref())
        == Some(req.source_thread_id.as_str())
        && existing.parent_checkpoint_id.as_ref() == Some(req.source_checkpoint_id);
    let same_kind = origin.as_ref().and_then(|o| o.branch_name.as_ref()).is_some()
        == req.branch_name.is_some();
    if same_source && same_kind {
        return Ok(());
    }
    Err(StoreError::Conflict(format!(
        "idempotency key {key:?} already used by checkpoint {} in thread {}",
        existing.checkpoint_id, existing.thread_id
    )))
}

fn checkpoint_in_thread(
    conn: &Connection,
    thread_id: &ThreadId,
    checkpoint_id: &CheckpointId,
) -> Result<Checkpoint> {
    CheckpointRepo::get_by_id(conn, checkpoint_id.as_str())?
        .filter(|c| c.thread_id == *thread_id)
        .ok_or_else(|| StoreError::not_found("checkpoint", checkpoint_id.as_str()))
}

fn next_position(tail: Option<&ThreadTail>, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
    match tail {
        None => (0, now),
        Some(tail) => (tail.max_sequence + 1, now.max(tail.last_created_at)),
    }
}

/// A parent in another thread is allowed when seeding an empty thread, or
/// when that thread is one this thread was resumed or branched from.
fn check_cross_thread_parent(conn: &Connection, thread_id: &str, parent_thread: &str) -> Result<()> {
    if CheckpointRepo::tail(conn, thread_id)?.is_none() {
        return Ok(());
    }
    if ancestor_threads(conn, thread_id)?
        .iter()
        .any(|t| t == parent_thread)
    {
        return Ok(());
    }
    Err(StoreError::InvalidState(format!(
        "parent checkpoint belongs to thread {parent_thread}, which is not an ancestor of {thread_id}"
    )))
}

/// Origin threads of `thread_id`, nearest first.
fn ancestor_threads(conn: &Connection, thread_id: &str) -> Result<Vec<String>> {
    let mut ancestors = Vec::new();
    let mut seen = HashSet::from([thread_id.to_string()]);
    let mut current = thread_id.to_string();

    loop {
        let Some(first) = CheckpointRepo::first_link(conn, &current)? else {
            break;
        };
        let Some(parent_id) = first.parent_checkpoint_id else {
            break;
        };
        let Some(parent) = CheckpointRepo::get_link(conn, &parent_id)? else {
            break;
        };
        if !seen.insert(parent.thread_id.clone()) {
            break;
        }
        ancestors.push(parent.thread_id.clone());
        current = parent.thread_id;
    }
    Ok(ancestors)
}

/// Walk parent links back from the latest checkpoint, staying inside the
/// thread, and return the chain oldest first. Forests come back unchanged.
fn history_chain(checkpoints: Vec<Checkpoint>) -> Vec<Checkpoint> {
    let Some(latest_id) = checkpoints.last().map(|c| c.checkpoint_id.clone()) else {
        return Vec::new();
    };
    let in_thread: HashSet<&CheckpointId> = checkpoints.iter().map(|c| &c.checkpoint_id).collect();
    let roots = checkpoints
        .iter()
        .filter(|c| {
            c.parent_checkpoint_id
                .as_ref()
                .map_or(true, |p| !in_thread.contains(p))
        })
        .count();
    if roots > 1 {
        return checkpoints;
    }
    let mut by_id: HashMap<CheckpointId, Checkpoint> = checkpoints
        .into_iter()
        .map(|c| (c.checkpoint_id.clone(), c))
        .collect();

    let mut chain = Vec::new();
    let mut next = Some(latest_id);
    while let Some(id) = next {
        let Some(checkpoint) = by_id.remove(&id) else {
            break;
        };
        next = checkpoint.parent_checkpoint_id.clone();
        chain.push(checkpoint);
    }
    chain.reverse();
    chain
}

fn span_from_new(thread_id: &ThreadId, new: NewSpan) -> Span {
    Span {
        trace_id: new.trace_id,
        span_id: new.span_id.unwrap_or_default(),
        parent_span_id: new.parent_span_id,
        thread_id: thread_id.clone(),
        name: new.name,
        start_time: truncate_micros(new.start_time),
        end_time: None,
        duration: None,
        attributes: new.attributes,
        status: SpanStatus::Ok,
    }
}

fn check_span_bounds(span_id: &SpanId, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end < start {
        return Err(StoreError::InvalidState(format!(
            "span {span_id} would end at {end} before it started at {start}"
        )));
    }
    Ok(())
}
