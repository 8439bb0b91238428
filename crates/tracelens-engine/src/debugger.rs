//! Synchronous facade over the store, the builders and the lineage manager.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracelens_core::graph::GraphResponse;
use tracelens_core::state::encoded_size;
use tracelens_core::thread::ThreadSummary;
use tracelens_core::timeline::Timeline;
use tracelens_core::{
    diff, Checkpoint, CheckpointId, Metadata, NewSpan, Span, SpanClose, SpanId, StateDiff,
    ThreadId,
};
use tracelens_settings::{LimitSettings, TracelensSettings};
use tracelens_store::{PutCheckpoint, StoreError, ThreadSnapshot, TraceStore, Written};
use tracelens_telemetry::{audit, metrics};
use tracing::{debug, info, instrument};

use crate::errors::{EngineError, Result};
use crate::graph::build_graph;
use crate::lineage::{BranchOutcome, BranchRequest, LineageManager, ResumeOutcome, ResumeRequest};
use crate::timeline::build_timeline;
use crate::validator::{StateValidator, ValidationIssue, ValidationReport};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffResponse {
    pub checkpoint_id_1: CheckpointId,
    pub checkpoint_id_2: CheckpointId,
    #[serde(flatten)]
    pub diff: StateDiff,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StateUpdate {
    pub state: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl StateUpdate {
    pub fn new(state: Value) -> Self {
        Self {
            state,
            description: None,
            idempotency_key: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateUpdateOutcome {
    pub new_checkpoint_id: CheckpointId,
    pub thread_id: ThreadId,
    /// Non-blocking issues found while validating the new state.
    pub warnings: Vec<ValidationIssue>,
}

pub struct Debugger {
    store: Arc<TraceStore>,
    validator: StateValidator,
    lineage: LineageManager,
}

impl Debugger {
    pub fn new(store: Arc<TraceStore>, limits: LimitSettings) -> Self {
        let validator = StateValidator::new(limits);
        let lineage = LineageManager::new(Arc::clone(&store), validator.clone());
        Self {
            store,
            validator,
            lineage,
        }
    }

    /// Open the configured database.
    pub fn open(settings: &TracelensSettings) -> Result<Self> {
        let store = TraceStore::open(&settings.database)?;
        Ok(Self::new(Arc::new(store), settings.limits.clone()))
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn validator(&self) -> &StateValidator {
        &self.validator
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn list_threads(&self) -> Result<Vec<ThreadSummary>> {
        Ok(self.store.list_threads()?)
    }

    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub fn graph(&self, thread_id: &ThreadId) -> Result<GraphResponse> {
        let started = Instant::now();
        let snapshot = self.snapshot(thread_id)?;
        let graph = build_graph(&snapshot);
        metrics::graph_built(started.elapsed());
        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "graph built"
        );
        Ok(graph)
    }

    pub fn timeline(&self, thread_id: &ThreadId) -> Result<Timeline> {
        let snapshot = self.snapshot(thread_id)?;
        Ok(build_timeline(&snapshot))
    }

    pub fn list_checkpoints(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        Ok(self.store.list_checkpoints(thread_id)?)
    }

    pub fn get_checkpoint(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Checkpoint> {
        Ok(self.store.get_checkpoint(thread_id, checkpoint_id)?)
    }

    pub fn latest_checkpoint(&self, thread_id: &ThreadId) -> Result<Option<Checkpoint>> {
        Ok(self.store.latest_checkpoint(thread_id)?)
    }

    pub fn history(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        Ok(self.store.history(thread_id)?)
    }

    pub fn lineage(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Vec<Checkpoint>> {
        Ok(self.store.lineage(thread_id, checkpoint_id)?)
    }

    pub fn list_spans(&self, thread_id: &ThreadId) -> Result<Vec<Span>> {
        Ok(self.store.list_spans(thread_id)?)
    }

    /// Key-level diff from `checkpoint_id_1` to `checkpoint_id_2`, both in
    /// `thread_id`.
    pub fn diff(
        &self,
        thread_id: &ThreadId,
        checkpoint_id_1: &CheckpointId,
        checkpoint_id_2: &CheckpointId,
    ) -> Result<DiffResponse> {
        let before = self.store.get_checkpoint(thread_id, checkpoint_id_1)?;
        let after = self.store.get_checkpoint(thread_id, checkpoint_id_2)?;
        Ok(DiffResponse {
            checkpoint_id_1: before.checkpoint_id,
            checkpoint_id_2: after.checkpoint_id,
            diff: diff(&before.state, &after.state),
        })
    }

    pub fn validate(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        candidate: &Value,
    ) -> Result<ValidationReport> {
        let original = self.store.get_checkpoint(thread_id, checkpoint_id)?;
        Ok(self.validator.validate(&original.state, candidate))
    }

    /// Validate raw JSON text. Unparsable input is reported, not raised.
    pub fn validate_json(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        text: &str,
    ) -> Result<ValidationReport> {
        let original = self.store.get_checkpoint(thread_id, checkpoint_id)?;
        Ok(self.validator.validate_json(&original.state, text))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edits
    // ─────────────────────────────────────────────────────────────────────

    /// Write an edited state as a child of `checkpoint_id`. The edit must
    /// pass validation against the checkpoint it replaces.
    #[instrument(skip(self, update), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub fn update_state(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        update: StateUpdate,
    ) -> Result<StateUpdateOutcome> {
        let original = self.store.get_checkpoint(thread_id, checkpoint_id)?;
        let (state, warnings) = self
            .validator
            .accept_with_warnings(&original.state, update.state)?;
        let description = update
            .description
            .unwrap_or_else(|| "State modified".to_string());

        let mut metadata = Metadata::new();
        metadata.insert("modified_from".into(), json!(checkpoint_id));
        metadata.insert("modification_time".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("description".into(), json!(description));

        let mut put = PutCheckpoint::new(state)
            .with_parent(checkpoint_id.clone())
            .with_metadata(metadata);
        if let Some(key) = update.idempotency_key {
            put = put.with_idempotency_key(key);
        }
        let Written { checkpoint: written, replayed } = self.store.write_checkpoint(thread_id, put)?;

        if replayed {
            debug!(new_checkpoint_id = %written.checkpoint_id, "state update replayed");
        } else {
            audit::log_state_update(
                thread_id.as_str(),
                checkpoint_id.as_str(),
                written.checkpoint_id.as_str(),
                Some(&description),
            );
            info!(new_checkpoint_id = %written.checkpoint_id, warnings = warnings.len(), "state updated");
        }

        Ok(StateUpdateOutcome {
            new_checkpoint_id: written.checkpoint_id,
            thread_id: written.thread_id,
            warnings,
        })
    }

    pub fn resume(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        req: ResumeRequest,
    ) -> Result<ResumeOutcome> {
        self.lineage.resume(thread_id, checkpoint_id, req)
    }

    pub fn branch(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        req: BranchRequest,
    ) -> Result<BranchOutcome> {
        self.lineage.branch(thread_id, checkpoint_id, req)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ingestion
    // ─────────────────────────────────────────────────────────────────────

    /// Record a checkpoint from the agent runtime. Only the size ceiling
    /// applies; the runtime's own states define the shape.
    pub fn put_checkpoint(&self, thread_id: &ThreadId, put: PutCheckpoint) -> Result<Checkpoint> {
        let size = encoded_size(&put.state);
        let limit = self.validator.limits().max_state_bytes;
        if size > limit {
            metrics::validation_failed();
            return Err(EngineError::PayloadTooLarge { size, limit });
        }
        Ok(self.store.put_checkpoint(thread_id, put)?)
    }

    pub fn open_span(&self, thread_id: &ThreadId, new: NewSpan) -> Result<Span> {
        Ok(self.store.open_span(thread_id, new)?)
    }

    pub fn close_span(&self, span_id: &SpanId, close: SpanClose) -> Result<Span> {
        Ok(self.store.close_span(span_id, close)?)
    }

    pub fn record_span(&self, thread_id: &ThreadId, new: NewSpan, close: SpanClose) -> Result<Span> {
        Ok(self.store.record_span(thread_id, new, close)?)
    }

    /// Thread contents in one read snapshot; `NotFound` for a thread with
    /// neither checkpoints nor spans.
    fn snapshot(&self, thread_id: &ThreadId) -> Result<ThreadSnapshot> {
        let snapshot = self.store.snapshot(thread_id)?;
        if snapshot.is_empty() {
            return Err(StoreError::not_found("thread", thread_id.as_str()).into());
        }
        Ok(snapshot)
    }
}
