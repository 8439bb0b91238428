use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ThreadId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Completed,
    Failed,
}

/// One row of the thread listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub thread_id: ThreadId,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub checkpoint_count: u64,
    pub span_count: u64,
    pub status: ThreadStatus,
    /// Thread this one was resumed or branched from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}
