use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SpanId, ThreadId, TraceId};
use crate::state::Metadata;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpanStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown span status: {other}")),
        }
    }
}

/// One unit of recorded execution work. Open while `end_time` is `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub thread_id: ThreadId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end; `None` while open.
    pub duration: Option<f64>,
    pub attributes: Metadata,
    pub status: SpanStatus,
}

impl Span {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Duration in seconds with microsecond resolution.
pub fn duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    micros as f64 / 1_000_000.0
}

/// Span as handed over by the instrumentation layer when it starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewSpan {
    pub trace_id: TraceId,
    /// Exporters usually supply their own id; one is generated otherwise.
    #[serde(default)]
    pub span_id: Option<SpanId>,
    #[serde(default)]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub attributes: Metadata,
}

/// Closing event for an open span.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpanClose {
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub status: SpanStatus,
    /// Keys merged over the span's attributes on close.
    #[serde(default)]
    pub attributes_patch: Option<Metadata>,
}
