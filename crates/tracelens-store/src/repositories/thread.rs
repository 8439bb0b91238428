use rusqlite::{params, Connection, OptionalExtension};
use tracelens_core::thread::{ThreadStatus, ThreadSummary};
use tracelens_core::ThreadId;

use crate::errors::{Result, StoreError};
use crate::row_helpers::parse_timestamp;

const TABLE: &str = "threads";

/// Threads are implicit: a thread exists once it owns a checkpoint or a
/// span. This repository aggregates over both tables.
pub struct ThreadRepo;

struct ThreadRow {
    thread_id: String,
    cp_first: Option<String>,
    cp_last: Option<String>,
    cp_count: i64,
    origin_thread_id: Option<String>,
    branch_name: Option<String>,
    span_first: Option<String>,
    span_last: Option<String>,
    span_count: i64,
    open_spans: i64,
    failed_spans: i64,
}

impl ThreadRow {
    fn into_summary(self) -> Result<ThreadSummary> {
        let parse = |raw: Option<String>, column| {
            raw.map(|s| parse_timestamp(&s, TABLE, column)).transpose()
        };
        let firsts = [parse(self.cp_first, "created_at")?, parse(self.span_first, "start_time")?];
        let lasts = [parse(self.cp_last, "created_at")?, parse(self.span_last, "end_time")?];
        let created_at = firsts.into_iter().flatten().min();
        let last_updated = lasts.into_iter().flatten().max();

        let status = if self.open_spans > 0 {
            ThreadStatus::Running
        } else if self.failed_spans > 0 {
            ThreadStatus::Failed
        } else {
            ThreadStatus::Completed
        };

        let (Some(created_at), Some(last_updated)) = (created_at, last_updated) else {
            return Err(StoreError::CorruptRow {
                table: TABLE,
                column: "thread_id",
                detail: format!("thread {} has no timestamps", self.thread_id),
            });
        };

        Ok(ThreadSummary {
            thread_id: ThreadId::from_raw(self.thread_id),
            created_at,
            last_updated,
            checkpoint_count: u64::try_from(self.cp_count).unwrap_or(0),
            span_count: u64::try_from(self.span_count).unwrap_or(0),
            status,
            origin_thread_id: self.origin_thread_id.map(ThreadId::from_raw),
            branch_name: self.branch_name,
        })
    }
}

impl ThreadRepo {
    /// Every known thread, most recently updated first.
    pub fn list_summaries(conn: &Connection) -> Result<Vec<ThreadSummary>> {
        let mut stmt = conn.prepare(
            "WITH cp AS (
                 SELECT thread_id, MIN(created_at) AS first_at, MAX(created_at) AS last_at,
                        COUNT(*) AS n, MAX(origin_thread_id) AS origin, MAX(branch_name) AS branch
                 FROM checkpoints GROUP BY thread_id
             ), sp AS (
                 SELECT thread_id, MIN(start_time) AS first_at,
                        MAX(COALESCE(end_time, start_time)) AS last_at, COUNT(*) AS n,
                        SUM(CASE WHEN end_time IS NULL THEN 1 ELSE 0 END) AS open_n,
                        SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS err_n
                 FROM spans GROUP BY thread_id
             ), ids AS (
                 SELECT thread_id FROM cp UNION SELECT thread_id FROM sp
             )
             SELECT ids.thread_id, cp.first_at, cp.last_at, COALESCE(cp.n, 0), cp.origin, cp.branch,
                    sp.first_at, sp.last_at, COALESCE(sp.n, 0), COALESCE(sp.open_n, 0),
                    COALESCE(sp.err_n, 0)
             FROM ids
             LEFT JOIN cp ON cp.thread_id = ids.thread_id
             LEFT JOIN sp ON sp.thread_id = ids.thread_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ThreadRow {
                    thread_id: row.get(0)?,
                    cp_first: row.get(1)?,
                    cp_last: row.get(2)?,
                    cp_count: row.get(3)?,
                    origin_thread_id: row.get(4)?,
                    branch_name: row.get(5)?,
                    span_first: row.get(6)?,
                    span_last: row.get(7)?,
                    span_count: row.get(8)?,
                    open_spans: row.get(9)?,
                    failed_spans: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut summaries = rows
            .into_iter()
            .map(ThreadRow::into_summary)
            .collect::<Result<Vec<_>>>()?;
        summaries.sort_by(|a, b| {
            b.last_updated
                .cmp(&a.last_updated)
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        Ok(summaries)
    }

    /// True if the thread owns at least one checkpoint or span.
    pub fn exists(conn: &Connection, thread_id: &str) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM checkpoints WHERE thread_id = ?1
                 UNION ALL
                 SELECT 1 FROM spans WHERE thread_id = ?1
                 LIMIT 1",
                params![thread_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}
