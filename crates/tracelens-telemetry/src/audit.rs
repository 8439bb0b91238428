//! Audit trail for operations that change what an agent will run next.
//!
//! Events go to the `tracelens::audit` target at INFO so they can be routed
//! separately with a filter such as `tracelens::audit=info`.

use tracing::info;

pub const TARGET: &str = "tracelens::audit";

const MAX_FIELD_LEN: usize = 500;

/// Truncate free text before it lands in the audit log.
pub fn sanitize(text: &str) -> String {
    if text.chars().count() <= MAX_FIELD_LEN {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_FIELD_LEN).collect();
    format!("{truncated}...")
}

pub fn log_state_update(
    thread_id: &str,
    checkpoint_id: &str,
    new_checkpoint_id: &str,
    description: Option<&str>,
) {
    let description = description.map(sanitize);
    info!(
        target: TARGET,
        event = "state_update",
        thread_id,
        checkpoint_id,
        new_checkpoint_id,
        description = description.as_deref(),
        "AUDIT: state_update"
    );
}

pub fn log_resume(
    thread_id: &str,
    checkpoint_id: &str,
    new_thread_id: &str,
    description: Option<&str>,
) {
    let description = description.map(sanitize);
    info!(
        target: TARGET,
        event = "resume_execution",
        thread_id,
        checkpoint_id,
        new_thread_id,
        description = description.as_deref(),
        "AUDIT: resume_execution"
    );
}

pub fn log_branch(
    thread_id: &str,
    checkpoint_id: &str,
    branch_thread_id: &str,
    branch_name: &str,
) {
    info!(
        target: TARGET,
        event = "branch_created",
        thread_id,
        checkpoint_id,
        branch_thread_id,
        branch_name = %sanitize(branch_name),
        "AUDIT: branch_created"
    );
}
