//! Agent state model.
//!
//! State is an open mapping from string keys to JSON values. There is no
//! fixed schema: whatever keys the agent wrote are the shape, and later
//! edits are checked against the shape of the checkpoint they derive from.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level agent state snapshot.
pub type State = serde_json::Map<String, Value>;

/// Free-form metadata attached to checkpoints and spans.
pub type Metadata = serde_json::Map<String, Value>;

/// Coarse JSON type of a value, used to detect shape drift between edits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(s)
    }
}

/// Serialized size of a state in bytes (compact JSON).
pub fn encoded_size(state: &State) -> usize {
    // A map with string keys always serializes.
    serde_json::to_vec(state).map_or(0, |bytes| bytes.len())
}
