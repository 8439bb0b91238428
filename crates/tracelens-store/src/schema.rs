//! SQL DDL for the TraceLens database.
//!
//! Checkpoints and spans live in one file so a snapshot of a thread can be
//! read in a single transaction. Timestamps are RFC 3339 UTC text with fixed
//! microsecond precision, which makes lexicographic order chronological.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::Result;

pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    checkpoint_id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    parent_checkpoint_id TEXT REFERENCES checkpoints(checkpoint_id),
    sequence INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    state TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    origin_thread_id TEXT,
    branch_name TEXT,
    idempotency_key TEXT,
    UNIQUE (thread_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_created
    ON checkpoints(thread_id, created_at, checkpoint_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_parent ON checkpoints(parent_checkpoint_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_branch_name
    ON checkpoints(origin_thread_id, branch_name) WHERE branch_name IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_idempotency
    ON checkpoints(idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS spans (
    span_id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    parent_span_id TEXT,
    thread_id TEXT NOT NULL,
    name TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    status TEXT NOT NULL DEFAULT 'ok',
    attributes TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_spans_thread_start ON spans(thread_id, start_time, span_id);
CREATE INDEX IF NOT EXISTS idx_spans_parent ON spans(parent_span_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

/// Applied to every pooled connection. `busy_timeout` is set separately
/// from configuration.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;

/// Create tables and record the schema version if this is a fresh file.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES)?;

    let version: Option<u32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    if version.is_none() {
        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
    }
    Ok(())
}
