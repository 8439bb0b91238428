use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CheckpointId, ThreadId};
use crate::state::{Metadata, State};

/// Immutable, parent-linked snapshot of agent state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub thread_id: ThreadId,
    /// May point into another thread when this checkpoint seeds a branch.
    pub parent_checkpoint_id: Option<CheckpointId>,
    /// Position within the thread, starting at 0.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub state: State,
    pub state_summary: StateSummary,
    pub metadata: Metadata,
}

impl Checkpoint {
    pub fn branch_name(&self) -> Option<&str> {
        self.metadata.get("branch_name").and_then(Value::as_str)
    }
}

/// Derived overview of a state blob for list views.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub step_count: i64,
    pub has_results: bool,
    pub has_summary: bool,
    pub error_count: i64,
    pub key_count: usize,
}

impl StateSummary {
    pub fn from_state(state: &State) -> Self {
        Self {
            step_count: state.get("step_count").and_then(Value::as_i64).unwrap_or(0),
            has_results: state.get("results").is_some_and(is_truthy),
            has_summary: state.get("summary").is_some_and(is_truthy),
            error_count: state.get("error_count").and_then(Value::as_i64).unwrap_or(0),
            key_count: state.len(),
        }
    }
}

/// Truthiness in the agent's own sense: empty strings and containers,
/// zero, false and null are all "absent".
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(v: Value) -> State {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn summary_of_research_state() {
        let s = state(json!({
            "query": "a",
            "step_count": 3,
            "results": ["x"],
            "summary": "",
            "error_count": 1
        }));
        let summary = StateSummary::from_state(&s);
        assert_eq!(summary.step_count, 3);
        assert!(summary.has_results);
        assert!(!summary.has_summary);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.key_count, 5);
    }

    #[test]
    fn summary_defaults_for_missing_keys() {
        let summary = StateSummary::from_state(&State::new());
        assert_eq!(summary, StateSummary::default());
    }

    #[test]
    fn non_integer_step_count_reads_as_zero() {
        let summary = StateSummary::from_state(&state(json!({"step_count": "three"})));
        assert_eq!(summary.step_count, 0);
    }
}
