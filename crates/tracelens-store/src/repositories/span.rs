use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracelens_core::span::duration_secs;
use tracelens_core::{Metadata, Span, SpanId, SpanStatus, ThreadId, TraceId};

use crate::errors::{is_constraint_violation, Result, StoreError};
use crate::row_helpers::{format_timestamp, parse_enum, parse_object, parse_timestamp};

const TABLE: &str = "spans";

const COLUMNS: &str =
    "span_id, trace_id, parent_span_id, thread_id, name, start_time, end_time, status, attributes";

struct SpanRow {
    span_id: String,
    trace_id: String,
    parent_span_id: Option<String>,
    thread_id: String,
    name: String,
    start_time: String,
    end_time: Option<String>,
    status: String,
    attributes: String,
}

impl SpanRow {
    fn into_span(self) -> Result<Span> {
        let start_time = parse_timestamp(&self.start_time, TABLE, "start_time")?;
        let end_time = self
            .end_time
            .as_deref()
            .map(|raw| parse_timestamp(raw, TABLE, "end_time"))
            .transpose()?;
        Ok(Span {
            trace_id: TraceId::from_raw(self.trace_id),
            span_id: SpanId::from_raw(self.span_id),
            parent_span_id: self.parent_span_id.map(SpanId::from_raw),
            thread_id: ThreadId::from_raw(self.thread_id),
            name: self.name,
            start_time,
            duration: end_time.map(|end| duration_secs(start_time, end)),
            end_time,
            attributes: parse_object(&self.attributes, TABLE, "attributes")?,
            status: parse_enum(&self.status, TABLE, "status")?,
        })
    }
}

/// Span repository. A span is written once when opened and updated once
/// when closed.
pub struct SpanRepo;

impl SpanRepo {
    /// Insert a span, open or already closed. A duplicate `span_id` is a
    /// `Conflict`.
    pub fn insert(conn: &Connection, span: &Span) -> Result<()> {
        let attributes = serde_json::to_string(&span.attributes)?;
        let inserted = conn.execute(
            "INSERT INTO spans (span_id, trace_id, parent_span_id, thread_id, name,
                                start_time, end_time, status, attributes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                span.span_id.as_str(),
                span.trace_id.as_str(),
                span.parent_span_id.as_ref().map(SpanId::as_str),
                span.thread_id.as_str(),
                span.name,
                format_timestamp(span.start_time),
                span.end_time.map(format_timestamp),
                span.status.to_string(),
                attributes,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "span {} already recorded",
                span.span_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Close an open span. Returns `false` when no open span has this id.
    pub fn close(
        conn: &Connection,
        span_id: &str,
        end_time: DateTime<Utc>,
        status: SpanStatus,
        attributes: &Metadata,
    ) -> Result<bool> {
        let attributes = serde_json::to_string(attributes)?;
        let changed = conn.execute(
            "UPDATE spans SET end_time = ?1, status = ?2, attributes = ?3
             WHERE span_id = ?4 AND end_time IS NULL",
            params![format_timestamp(end_time), status.to_string(), attributes, span_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_by_id(conn: &Connection, span_id: &str) -> Result<Option<Span>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM spans WHERE span_id = ?1"),
                params![span_id],
                Self::map_row,
            )
            .optional()?;
        row.map(SpanRow::into_span).transpose()
    }

    /// Spans of a thread ordered by start time, ties broken by id.
    pub fn list_by_thread(conn: &Connection, thread_id: &str) -> Result<Vec<Span>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM spans WHERE thread_id = ?1
             ORDER BY start_time ASC, span_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![thread_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(SpanRow::into_span).collect()
    }

    pub fn thread_of(conn: &Connection, span_id: &str) -> Result<Option<ThreadId>> {
        let thread: Option<String> = conn
            .query_row(
                "SELECT thread_id FROM spans WHERE span_id = ?1",
                params![span_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(thread.map(ThreadId::from_raw))
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SpanRow> {
        Ok(SpanRow {
            span_id: row.get(0)?,
            trace_id: row.get(1)?,
            parent_span_id: row.get(2)?,
            thread_id: row.get(3)?,
            name: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            status: row.get(7)?,
            attributes: row.get(8)?,
        })
    }
}
