//! Resume and branch: seed a new thread from an existing checkpoint.
//!
//! Neither operation runs the agent. They write one checkpoint into a fresh
//! thread whose parent is the source checkpoint; the agent runtime picks
//! the returned thread id up from there. The source thread is never touched.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracelens_core::ids::short_suffix;
use tracelens_core::{Checkpoint, CheckpointId, Metadata, State, ThreadId};
use tracelens_store::{ForkRequest, TraceStore, Written};
use tracelens_telemetry::{audit, metrics};
use tracing::{debug, info, instrument};

use crate::errors::{EngineError, Result};
use crate::validator::{StateValidator, ValidationReport};

pub const MAX_BRANCH_NAME_LEN: usize = 128;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResumeRequest {
    /// Replaces the source state wholesale when present.
    pub modified_state: Option<Value>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BranchRequest {
    /// Defaults to `branch_{8 hex}`.
    pub branch_name: Option<String>,
    pub modified_state: Option<Value>,
    pub description: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub new_thread_id: ThreadId,
    pub original_thread_id: ThreadId,
    pub from_checkpoint_id: CheckpointId,
    /// Seed checkpoint in the new thread.
    pub checkpoint_id: CheckpointId,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BranchOutcome {
    pub branch_thread_id: ThreadId,
    pub original_thread_id: ThreadId,
    pub from_checkpoint_id: CheckpointId,
    pub branch_name: String,
    pub checkpoint_id: CheckpointId,
}

pub struct LineageManager {
    store: Arc<TraceStore>,
    validator: StateValidator,
}

impl LineageManager {
    pub fn new(store: Arc<TraceStore>, validator: StateValidator) -> Self {
        Self { store, validator }
    }

    #[instrument(skip(self, req), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub fn resume(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        req: ResumeRequest,
    ) -> Result<ResumeOutcome> {
        let state = self.seed_state(thread_id, checkpoint_id, req.modified_state)?;
        let description = req
            .description
            .unwrap_or_else(|| "Resumed execution from checkpoint".to_string());

        let mut metadata = Metadata::new();
        metadata.insert("resumed_from_thread".into(), json!(thread_id));
        metadata.insert("resumed_from_checkpoint".into(), json!(checkpoint_id));
        metadata.insert("resume_time".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("description".into(), json!(description));

        let target = thread_id.resumed();
        let Written { checkpoint: seed, replayed } = self.store.fork(ForkRequest {
            source_thread_id: thread_id,
            source_checkpoint_id: checkpoint_id,
            target_thread_id: &target,
            state,
            metadata,
            branch_name: None,
            idempotency_key: req.idempotency_key.as_deref(),
        })?;

        if replayed {
            debug!(new_thread_id = %seed.thread_id, "resume replayed");
        } else {
            metrics::fork_created("resume");
            audit::log_resume(
                thread_id.as_str(),
                checkpoint_id.as_str(),
                seed.thread_id.as_str(),
                Some(&description),
            );
            info!(new_thread_id = %seed.thread_id, "thread resumed");
        }

        Ok(ResumeOutcome {
            new_thread_id: seed.thread_id,
            original_thread_id: thread_id.clone(),
            from_checkpoint_id: checkpoint_id.clone(),
            checkpoint_id: seed.checkpoint_id,
        })
    }

    /// Branch names are unique per source thread; reusing one is a
    /// `Conflict`.
    #[instrument(skip(self, req), fields(thread_id = %thread_id, checkpoint_id = %checkpoint_id))]
    pub fn branch(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        req: BranchRequest,
    ) -> Result<BranchOutcome> {
        let branch_name = match req.branch_name {
            Some(name) => {
                check_branch_name(&name)?;
                name
            }
            None => format!("branch_{}", short_suffix()),
        };
        let state = self.seed_state(thread_id, checkpoint_id, req.modified_state)?;
        let description = req
            .description
            .unwrap_or_else(|| format!("Branch '{branch_name}' from checkpoint"));

        let mut metadata = Metadata::new();
        metadata.insert("branched_from_thread".into(), json!(thread_id));
        metadata.insert("branched_from_checkpoint".into(), json!(checkpoint_id));
        metadata.insert("branch_name".into(), json!(branch_name));
        metadata.insert("branch_time".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("description".into(), json!(description));

        let target = self.branch_target(thread_id, &branch_name)?;
        let Written { checkpoint: seed, replayed } = self.store.fork(ForkRequest {
            source_thread_id: thread_id,
            source_checkpoint_id: checkpoint_id,
            target_thread_id: &target,
            state,
            metadata,
            branch_name: Some(&branch_name),
            idempotency_key: req.idempotency_key.as_deref(),
        })?;

        if replayed {
            debug!(branch_thread_id = %seed.thread_id, "branch replayed");
        } else {
            metrics::fork_created("branch");
            audit::log_branch(
                thread_id.as_str(),
                checkpoint_id.as_str(),
                seed.thread_id.as_str(),
                &branch_name,
            );
            info!(branch_thread_id = %seed.thread_id, branch_name = %branch_name, "branch created");
        }

        Ok(BranchOutcome {
            branch_name: branch_name_of(&seed).unwrap_or(branch_name),
            branch_thread_id: seed.thread_id,
            original_thread_id: thread_id.clone(),
            from_checkpoint_id: checkpoint_id.clone(),
            checkpoint_id: seed.checkpoint_id,
        })
    }

    /// `{thread}_{name}`, or `{thread}_{name}_{8 hex}` when another thread
    /// already owns that id (`t1` + `a_b` and `t1_a` + `b` meet at `t1_a_b`).
    /// Name reuse on the same source thread still fails in the store.
    fn branch_target(&self, thread_id: &ThreadId, branch_name: &str) -> Result<ThreadId> {
        let target = thread_id.branched(branch_name);
        if self.store.thread_exists(&target)? {
            return Ok(thread_id.branched(&format!("{branch_name}_{}", short_suffix())));
        }
        Ok(target)
    }

    /// `None` means "copy the source state"; the store reads it inside the
    /// fork transaction. A modified state is validated against the source.
    fn seed_state(
        &self,
        thread_id: &ThreadId,
        checkpoint_id: &CheckpointId,
        modified: Option<Value>,
    ) -> Result<Option<State>> {
        let source = self.store.get_checkpoint(thread_id, checkpoint_id)?;
        modified
            .map(|candidate| self.validator.accept(&source.state, candidate))
            .transpose()
    }
}

/// An idempotent replay returns the stored seed, whose name may differ
/// from a freshly generated default.
fn branch_name_of(seed: &Checkpoint) -> Option<String> {
    seed.branch_name().map(str::to_string)
}

/// Branch names end up inside thread ids, so they are restricted to
/// `[A-Za-z0-9_.-]`.
pub fn check_branch_name(name: &str) -> Result<()> {
    let problem = if name.is_empty() {
        Some("branch name must not be empty".to_string())
    } else if name.chars().count() > MAX_BRANCH_NAME_LEN {
        Some(format!("branch name exceeds {MAX_BRANCH_NAME_LEN} characters"))
    } else if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        Some("branch name may only contain letters, digits, '_', '-' and '.'".to_string())
    } else {
        None
    };
    match problem {
        Some(message) => Err(EngineError::Validation(ValidationReport::rejected(
            "branch_name",
            message,
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tracelens_core::ErrorKind;
    use tracelens_settings::LimitSettings;
    use tracelens_store::PutCheckpoint;

    fn state(v: Value) -> State {
        v.as_object().unwrap().clone()
    }

    fn setup() -> (LineageManager, Arc<TraceStore>, ThreadId, Checkpoint) {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        let thread = ThreadId::from_raw("t1");
        let cp = store
            .put_checkpoint(
                &thread,
                PutCheckpoint::new(state(json!({"step_count": 1, "query": "a", "result": "x"}))),
            )
            .unwrap();
        let manager = LineageManager::new(
            Arc::clone(&store),
            StateValidator::new(LimitSettings::default()),
        );
        (manager, store, thread, cp)
    }

    #[test]
    fn resume_copies_state_into_new_thread() {
        let (manager, store, thread, cp) = setup();
        let outcome = manager
            .resume(&thread, &cp.checkpoint_id, ResumeRequest::default())
            .unwrap();

        assert_ne!(outcome.new_thread_id, thread);
        assert!(outcome.new_thread_id.as_str().starts_with("t1_resume_"));
        let seeded = store.list_checkpoints(&outcome.new_thread_id).unwrap();
        assert_eq!(seeded.len(), 1);
        assert_eq!(seeded[0].state, cp.state);
        assert_eq!(seeded[0].parent_checkpoint_id.as_ref(), Some(&cp.checkpoint_id));
        assert_eq!(seeded[0].metadata["resumed_from_thread"], "t1");
        assert_eq!(
            seeded[0].metadata["description"],
            "Resumed execution from checkpoint"
        );
    }

    #[test]
    fn resume_with_modified_state() {
        let (manager, store, thread, cp) = setup();
        let outcome = manager
            .resume(
                &thread,
                &cp.checkpoint_id,
                ResumeRequest {
                    modified_state: Some(json!({"step_count": 1, "query": "b", "result": "x"})),
                    description: Some("retry with b".into()),
                    ..ResumeRequest::default()
                },
            )
            .unwrap();
        let seed = store
            .get_checkpoint(&outcome.new_thread_id, &outcome.checkpoint_id)
            .unwrap();
        assert_eq!(seed.state["query"], "b");
        assert_eq!(seed.metadata["description"], "retry with b");
    }

    #[test]
    fn invalid_modified_state_creates_nothing() {
        let (manager, store, thread, cp) = setup();
        let before = store.list_threads().unwrap().len();
        let err = manager
            .resume(
                &thread,
                &cp.checkpoint_id,
                ResumeRequest {
                    modified_state: Some(json!({"query": "a"})),
                    ..ResumeRequest::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.list_threads().unwrap().len(), before);
    }

    #[test]
    fn branch_names_thread_and_rejects_reuse() {
        let (manager, store, thread, cp) = setup();
        let req = || BranchRequest {
            branch_name: Some("alt".into()),
            ..BranchRequest::default()
        };
        let outcome = manager.branch(&thread, &cp.checkpoint_id, req()).unwrap();
        assert_eq!(outcome.branch_thread_id.as_str(), "t1_alt");
        assert_eq!(outcome.branch_name, "alt");

        let seed = store.latest_checkpoint(&outcome.branch_thread_id).unwrap().unwrap();
        assert_eq!(seed.branch_name(), Some("alt"));
        assert_eq!(seed.metadata["branched_from_checkpoint"], json!(cp.checkpoint_id));
        assert_eq!(seed.metadata["description"], "Branch 'alt' from checkpoint");

        let err = manager.branch(&thread, &cp.checkpoint_id, req()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn branch_without_name_gets_generated_one() {
        let (manager, _store, thread, cp) = setup();
        let outcome = manager
            .branch(&thread, &cp.checkpoint_id, BranchRequest::default())
            .unwrap();
        assert!(outcome.branch_name.starts_with("branch_"));
        assert_eq!(outcome.branch_name.len(), "branch_".len() + 8);
        assert_eq!(
            outcome.branch_thread_id.as_str(),
            format!("t1_{}", outcome.branch_name)
        );
    }

    #[test]
    fn idempotent_branch_replays() {
        let (manager, store, thread, cp) = setup();
        let req = || BranchRequest {
            idempotency_key: Some("k1".into()),
            ..BranchRequest::default()
        };
        let first = manager.branch(&thread, &cp.checkpoint_id, req()).unwrap();
        let second = manager.branch(&thread, &cp.checkpoint_id, req()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.list_threads().unwrap().len(), 2);
    }

    #[test]
    fn branch_ids_colliding_across_threads_get_suffix() {
        let (manager, store, thread, cp) = setup();
        let first = manager
            .branch(
                &thread,
                &cp.checkpoint_id,
                BranchRequest {
                    branch_name: Some("a_b".into()),
                    ..BranchRequest::default()
                },
            )
            .unwrap();
        assert_eq!(first.branch_thread_id.as_str(), "t1_a_b");

        let other = ThreadId::from_raw("t1_a");
        let other_cp = store
            .put_checkpoint(
                &other,
                PutCheckpoint::new(state(json!({"step_count": 1, "query": "a", "result": "x"}))),
            )
            .unwrap();
        let second = manager
            .branch(
                &other,
                &other_cp.checkpoint_id,
                BranchRequest {
                    branch_name: Some("b".into()),
                    ..BranchRequest::default()
                },
            )
            .unwrap();

        assert_eq!(second.branch_name, "b");
        assert!(second.branch_thread_id.as_str().starts_with("t1_a_b_"));
        assert_eq!(second.branch_thread_id.as_str().len(), "t1_a_b_".len() + 8);
        assert_eq!(store.list_checkpoints(&first.branch_thread_id).unwrap().len(), 1);
    }

    #[test]
    fn resume_key_of_state_edit_conflicts() {
        let (manager, store, thread, cp) = setup();
        store
            .put_checkpoint(
                &thread,
                PutCheckpoint::new(state(json!({"step_count": 2, "query": "a", "result": "y"})))
                    .with_parent(cp.checkpoint_id.clone())
                    .with_idempotency_key("k"),
            )
            .unwrap();
        let req = || ResumeRequest {
            idempotency_key: Some("k".into()),
            ..ResumeRequest::default()
        };

        let err = manager.resume(&thread, &cp.checkpoint_id, req()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let other = ThreadId::from_raw("t2");
        let other_cp = store
            .put_checkpoint(&other, PutCheckpoint::new(state(json!({"step_count": 0}))))
            .unwrap();
        let err = manager.resume(&other, &other_cp.checkpoint_id, req()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(store.list_threads().unwrap().len(), 2);
    }

    #[test]
    fn unknown_checkpoint_is_not_found() {
        let (manager, _store, thread, _cp) = setup();
        let err = manager
            .resume(&thread, &CheckpointId::from_raw("cp_nope"), ResumeRequest::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn branch_name_rules() {
        assert!(check_branch_name("alt-1.v2_x").is_ok());
        for bad in ["", "has space", "slash/name", &"x".repeat(MAX_BRANCH_NAME_LEN + 1)] {
            let err = check_branch_name(bad).unwrap_err();
            assert_matches!(&err, EngineError::Validation(r) if r.error_fields() == ["branch_name"]);
        }
    }
}
