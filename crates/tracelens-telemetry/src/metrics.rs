//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade. Without an installed
//! recorder every call is a no-op, so the core never depends on an exporter.

use std::time::Duration;

pub const CHECKPOINTS_WRITTEN: &str = "tracelens_checkpoints_written_total";
pub const SPANS_OPENED: &str = "tracelens_spans_opened_total";
pub const SPANS_CLOSED: &str = "tracelens_spans_closed_total";
pub const FORKS: &str = "tracelens_forks_total";
pub const VALIDATION_FAILURES: &str = "tracelens_validation_failures_total";
pub const STORE_BUSY_RETRIES: &str = "tracelens_store_busy_retries_total";
pub const GRAPH_BUILD_SECONDS: &str = "tracelens_graph_build_seconds";

pub fn checkpoint_written() {
    ::metrics::counter!(CHECKPOINTS_WRITTEN).increment(1);
}

pub fn span_opened() {
    ::metrics::counter!(SPANS_OPENED).increment(1);
}

pub fn span_closed(status: &'static str) {
    ::metrics::counter!(SPANS_CLOSED, "status" => status).increment(1);
}

/// `kind` is `resume` or `branch`.
pub fn fork_created(kind: &'static str) {
    ::metrics::counter!(FORKS, "kind" => kind).increment(1);
}

pub fn validation_failed() {
    ::metrics::counter!(VALIDATION_FAILURES).increment(1);
}

pub fn store_busy_retry() {
    ::metrics::counter!(STORE_BUSY_RETRIES).increment(1);
}

pub fn graph_built(elapsed: Duration) {
    ::metrics::histogram!(GRAPH_BUILD_SECONDS).record(elapsed.as_secs_f64());
}
