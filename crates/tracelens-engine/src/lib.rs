//! # tracelens-engine
//!
//! Read-side transformations (graph, timeline, diff) and guarded write
//! operations (state edits, resume, branch) over a [`TraceStore`].
//!
//! [`Debugger`] is the synchronous facade a serving layer calls;
//! [`AsyncDebugger`] runs the same operations on tokio's blocking pool under
//! a time budget.
//!
//! [`TraceStore`]: tracelens_store::TraceStore

pub mod debugger;
pub mod errors;
pub mod graph;
pub mod handle;
pub mod lineage;
pub mod timeline;
pub mod validator;

pub use debugger::{DiffResponse, Debugger, StateUpdate, StateUpdateOutcome};
pub use errors::{EngineError, Result};
pub use handle::AsyncDebugger;
pub use lineage::{BranchOutcome, BranchRequest, LineageManager, ResumeOutcome, ResumeRequest};
pub use validator::{Severity, StateValidator, ValidationIssue, ValidationReport};
