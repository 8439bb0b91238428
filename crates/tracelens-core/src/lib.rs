pub mod checkpoint;
pub mod diff;
pub mod errors;
pub mod graph;
pub mod ids;
pub mod span;
pub mod state;
pub mod thread;
pub mod timeline;

pub use checkpoint::{Checkpoint, StateSummary};
pub use diff::{diff, StateDiff};
pub use errors::ErrorKind;
pub use ids::{CheckpointId, SpanId, ThreadId, TraceId};
pub use span::{NewSpan, Span, SpanClose, SpanStatus};
pub use state::{Metadata, State};
