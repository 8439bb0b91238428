//! Async handle for callers running on tokio.
//!
//! Store work is blocking SQLite I/O, so every call moves to the blocking
//! pool and is bounded by the operation budget. A write whose budget runs
//! out may still commit in the background; retry it with the same
//! idempotency key.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task;
use tracelens_core::graph::GraphResponse;
use tracelens_core::thread::ThreadSummary;
use tracelens_core::timeline::Timeline;
use tracelens_core::{Checkpoint, CheckpointId, Span, ThreadId};
use tracing::warn;

use crate::debugger::{Debugger, DiffResponse, StateUpdate, StateUpdateOutcome};
use crate::errors::{EngineError, Result};
use crate::lineage::{BranchOutcome, BranchRequest, ResumeOutcome, ResumeRequest};
use crate::validator::ValidationReport;

#[derive(Clone)]
pub struct AsyncDebugger {
    inner: Arc<Debugger>,
    budget: Duration,
}

impl AsyncDebugger {
    /// The budget defaults to the store's operation timeout.
    pub fn new(inner: Arc<Debugger>) -> Self {
        let budget = inner.store().operation_timeout();
        Self { inner, budget }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn inner(&self) -> &Arc<Debugger> {
        &self.inner
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Debugger) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let join = task::spawn_blocking(move || f(&inner));
        match tokio::time::timeout(self.budget, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(EngineError::Task(format!("{op}: {e}"))),
            Err(_) => {
                warn!(op, budget_ms = self.budget.as_millis() as u64, "operation exceeded budget");
                Err(EngineError::Timeout(self.budget))
            }
        }
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        self.run("list_threads", |d| d.list_threads()).await
    }

    pub async fn graph(&self, thread_id: ThreadId) -> Result<GraphResponse> {
        self.run("graph", move |d| d.graph(&thread_id)).await
    }

    pub async fn timeline(&self, thread_id: ThreadId) -> Result<Timeline> {
        self.run("timeline", move |d| d.timeline(&thread_id)).await
    }

    pub async fn list_checkpoints(&self, thread_id: ThreadId) -> Result<Vec<Checkpoint>> {
        self.run("list_checkpoints", move |d| d.list_checkpoints(&thread_id))
            .await
    }

    pub async fn get_checkpoint(
        &self,
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
    ) -> Result<Checkpoint> {
        self.run("get_checkpoint", move |d| {
            d.get_checkpoint(&thread_id, &checkpoint_id)
        })
        .await
    }

    pub async fn list_spans(&self, thread_id: ThreadId) -> Result<Vec<Span>> {
        self.run("list_spans", move |d| d.list_spans(&thread_id)).await
    }

    pub async fn diff(
        &self,
        thread_id: ThreadId,
        checkpoint_id_1: CheckpointId,
        checkpoint_id_2: CheckpointId,
    ) -> Result<DiffResponse> {
        self.run("diff", move |d| {
            d.diff(&thread_id, &checkpoint_id_1, &checkpoint_id_2)
        })
        .await
    }

    pub async fn validate(
        &self,
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        candidate: Value,
    ) -> Result<ValidationReport> {
        self.run("validate", move |d| {
            d.validate(&thread_id, &checkpoint_id, &candidate)
        })
        .await
    }

    pub async fn update_state(
        &self,
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        update: StateUpdate,
    ) -> Result<StateUpdateOutcome> {
        self.run("update_state", move |d| {
            d.update_state(&thread_id, &checkpoint_id, update)
        })
        .await
    }

    pub async fn resume(
        &self,
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        req: ResumeRequest,
    ) -> Result<ResumeOutcome> {
        self.run("resume", move |d| d.resume(&thread_id, &checkpoint_id, req))
            .await
    }

    pub async fn branch(
        &self,
        thread_id: ThreadId,
        checkpoint_id: CheckpointId,
        req: BranchRequest,
    ) -> Result<BranchOutcome> {
        self.run("branch", move |d| d.branch(&thread_id, &checkpoint_id, req))
            .await
    }
}
