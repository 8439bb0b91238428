use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ThreadId;
use crate::state::Metadata;

/// Label on edges that follow an actually recorded transition.
pub const EXECUTION_LABEL: &str = "execution";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    AgentNode,
    ToolNode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub condition: Option<String>,
    pub label: Option<String>,
}

impl GraphEdge {
    pub fn is_execution(&self) -> bool {
        self.label.as_deref() == Some(EXECUTION_LABEL)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub thread_id: ThreadId,
    pub start_time: Option<DateTime<Utc>>,
    /// `None` while any span of the thread is still open.
    pub end_time: Option<DateTime<Utc>>,
    pub total_checkpoints: usize,
    pub total_spans: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub metadata: GraphMetadata,
}
