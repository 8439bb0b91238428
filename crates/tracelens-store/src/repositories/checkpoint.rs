use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracelens_core::{Checkpoint, CheckpointId, Metadata, State, StateSummary, ThreadId};

use crate::errors::{is_constraint_violation, Result, StoreError};
use crate::row_helpers::{format_timestamp, parse_object, parse_timestamp};

const TABLE: &str = "checkpoints";

const COLUMNS: &str =
    "checkpoint_id, thread_id, parent_checkpoint_id, sequence, created_at, state, metadata";

/// Raw column values, decoded into a [`Checkpoint`] outside the row closure.
struct CheckpointRow {
    checkpoint_id: String,
    thread_id: String,
    parent_checkpoint_id: Option<String>,
    sequence: i64,
    created_at: String,
    state: String,
    metadata: String,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let state: State = parse_object(&self.state, TABLE, "state")?;
        let metadata: Metadata = parse_object(&self.metadata, TABLE, "metadata")?;
        Ok(Checkpoint {
            checkpoint_id: CheckpointId::from_raw(self.checkpoint_id),
            thread_id: ThreadId::from_raw(self.thread_id),
            parent_checkpoint_id: self.parent_checkpoint_id.map(CheckpointId::from_raw),
            sequence: self.sequence,
            created_at: parse_timestamp(&self.created_at, TABLE, "created_at")?,
            state_summary: StateSummary::from_state(&state),
            state,
            metadata,
        })
    }
}

/// Columns of a new row that are not part of [`Checkpoint`].
#[derive(Clone, Copy, Debug, Default)]
pub struct InsertCheckpoint<'a> {
    /// Set on the first checkpoint of a resumed or branched thread.
    pub origin_thread_id: Option<&'a str>,
    pub branch_name: Option<&'a str>,
    pub idempotency_key: Option<&'a str>,
}

/// Parent link of a checkpoint without its state blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointLink {
    pub checkpoint_id: String,
    pub thread_id: String,
    pub parent_checkpoint_id: Option<String>,
}

/// Where a seed checkpoint was forked from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkOrigin {
    pub origin_thread_id: Option<String>,
    pub branch_name: Option<String>,
}

/// Highest sequence and latest timestamp of a thread.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadTail {
    pub max_sequence: i64,
    pub last_created_at: DateTime<Utc>,
}

/// Checkpoint repository. Rows are never updated or deleted.
pub struct CheckpointRepo;

impl CheckpointRepo {
    /// Insert a fully built checkpoint. Unique violations (duplicate id,
    /// sequence, branch name or idempotency key) surface as `Conflict`.
    pub fn insert(
        conn: &Connection,
        checkpoint: &Checkpoint,
        extra: &InsertCheckpoint<'_>,
    ) -> Result<()> {
        let state = serde_json::to_string(&checkpoint.state)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;
        let inserted = conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, thread_id, parent_checkpoint_id, sequence, created_at,
                                      state, metadata, origin_thread_id, branch_name, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                checkpoint.checkpoint_id.as_str(),
                checkpoint.thread_id.as_str(),
                checkpoint.parent_checkpoint_id.as_ref().map(CheckpointId::as_str),
                checkpoint.sequence,
                format_timestamp(checkpoint.created_at),
                state,
                metadata,
                extra.origin_thread_id,
                extra.branch_name,
                extra.idempotency_key,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => Err(StoreError::Conflict(format!(
                "checkpoint {} in thread {}: {e}",
                checkpoint.checkpoint_id, checkpoint.thread_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_by_id(conn: &Connection, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM checkpoints WHERE checkpoint_id = ?1"),
                params![checkpoint_id],
                Self::map_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    pub fn get_by_idempotency_key(conn: &Connection, key: &str) -> Result<Option<Checkpoint>> {
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM checkpoints WHERE idempotency_key = ?1"),
                params![key],
                Self::map_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// All checkpoints of a thread, oldest first. Ties on `created_at`
    /// break on the id.
    pub fn list_by_thread(conn: &Connection, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM checkpoints WHERE thread_id = ?1
             ORDER BY created_at ASC, checkpoint_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![thread_id], Self::map_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    pub fn latest(conn: &Connection, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM checkpoints WHERE thread_id = ?1
                     ORDER BY created_at DESC, checkpoint_id DESC LIMIT 1"
                ),
                params![thread_id],
                Self::map_row,
            )
            .optional()?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    pub fn tail(conn: &Connection, thread_id: &str) -> Result<Option<ThreadTail>> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT MAX(sequence), MAX(created_at) FROM checkpoints
                 WHERE thread_id = ?1 HAVING COUNT(*) > 0",
                params![thread_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(max_sequence, created_at)| {
            Ok(ThreadTail {
                max_sequence,
                last_created_at: parse_timestamp(&created_at, TABLE, "created_at")?,
            })
        })
        .transpose()
    }

    /// Fork columns of a checkpoint. Both are `None` for a plain put.
    pub fn fork_origin(conn: &Connection, checkpoint_id: &str) -> Result<Option<ForkOrigin>> {
        let origin = conn
            .query_row(
                "SELECT origin_thread_id, branch_name FROM checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                |row| {
                    Ok(ForkOrigin {
                        origin_thread_id: row.get(0)?,
                        branch_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(origin)
    }

    pub fn get_link(conn: &Connection, checkpoint_id: &str) -> Result<Option<CheckpointLink>> {
        let link = conn
            .query_row(
                "SELECT checkpoint_id, thread_id, parent_checkpoint_id FROM checkpoints
                 WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                Self::map_link,
            )
            .optional()?;
        Ok(link)
    }

    /// Link of the first checkpoint of a thread. For a resumed or branched
    /// thread its parent sits in the origin thread.
    pub fn first_link(conn: &Connection, thread_id: &str) -> Result<Option<CheckpointLink>> {
        let link = conn
            .query_row(
                "SELECT checkpoint_id, thread_id, parent_checkpoint_id FROM checkpoints
                 WHERE thread_id = ?1 ORDER BY sequence ASC LIMIT 1",
                params![thread_id],
                Self::map_link,
            )
            .optional()?;
        Ok(link)
    }

    pub fn branch_name_taken(
        conn: &Connection,
        origin_thread_id: &str,
        branch_name: &str,
    ) -> Result<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM checkpoints WHERE origin_thread_id = ?1 AND branch_name = ?2",
                params![origin_thread_id, branch_name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRow> {
        Ok(CheckpointRow {
            checkpoint_id: row.get(0)?,
            thread_id: row.get(1)?,
            parent_checkpoint_id: row.get(2)?,
            sequence: row.get(3)?,
            created_at: row.get(4)?,
            state: row.get(5)?,
            metadata: row.get(6)?,
        })
    }

    fn map_link(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointLink> {
        Ok(CheckpointLink {
            checkpoint_id: row.get(0)?,
            thread_id: row.get(1)?,
            parent_checkpoint_id: row.get(2)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    fn checkpoint(id: &str, thread: &str, parent: Option<&str>, seq: i64, secs: u32) -> Checkpoint {
        let state = json!({"step_count": seq}).as_object().unwrap().clone();
        Checkpoint {
            checkpoint_id: CheckpointId::from_raw(id),
            thread_id: ThreadId::from_raw(thread),
            parent_checkpoint_id: parent.map(CheckpointId::from_raw),
            sequence: seq,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap(),
            state_summary: StateSummary::from_state(&state),
            state,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn insert_and_get() {
        let conn = setup();
        let cp = checkpoint("c1", "t1", None, 0, 1);
        CheckpointRepo::insert(&conn, &cp, &InsertCheckpoint::default()).unwrap();
        let found = CheckpointRepo::get_by_id(&conn, "c1").unwrap().unwrap();
        assert_eq!(found, cp);
        assert_eq!(found.state_summary.step_count, 0);
        assert!(CheckpointRepo::get_by_id(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn list_orders_by_time_then_id() {
        let conn = setup();
        let none = InsertCheckpoint::default();
        CheckpointRepo::insert(&conn, &checkpoint("b", "t1", None, 0, 1), &none).unwrap();
        CheckpointRepo::insert(&conn, &checkpoint("a", "t1", Some("b"), 1, 1), &none).unwrap();
        CheckpointRepo::insert(&conn, &checkpoint("c", "t1", Some("a"), 2, 2), &none).unwrap();
        CheckpointRepo::insert(&conn, &checkpoint("z", "t2", None, 0, 0), &none).unwrap();

        let ids: Vec<_> = CheckpointRepo::list_by_thread(&conn, "t1")
            .unwrap()
            .into_iter()
            .map(|c| c.checkpoint_id.into_inner())
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
        let latest = CheckpointRepo::latest(&conn, "t1").unwrap().unwrap();
        assert_eq!(latest.checkpoint_id.as_str(), "c");
    }

    #[test]
    fn tail_of_empty_thread_is_none() {
        let conn = setup();
        assert!(CheckpointRepo::tail(&conn, "t1").unwrap().is_none());
        CheckpointRepo::insert(&conn, &checkpoint("c1", "t1", None, 0, 5), &InsertCheckpoint::default())
            .unwrap();
        let tail = CheckpointRepo::tail(&conn, "t1").unwrap().unwrap();
        assert_eq!(tail.max_sequence, 0);
        assert_eq!(tail.last_created_at, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 5).unwrap());
    }

    #[test]
    fn duplicate_branch_name_conflicts() {
        let conn = setup();
        let none = InsertCheckpoint::default();
        CheckpointRepo::insert(&conn, &checkpoint("root", "t1", None, 0, 0), &none).unwrap();
        let branch = InsertCheckpoint {
            origin_thread_id: Some("t1"),
            branch_name: Some("alt"),
            idempotency_key: None,
        };
        CheckpointRepo::insert(&conn, &checkpoint("b1", "t1_alt", Some("root"), 0, 1), &branch)
            .unwrap();
        assert!(CheckpointRepo::branch_name_taken(&conn, "t1", "alt").unwrap());
        assert_eq!(
            CheckpointRepo::fork_origin(&conn, "b1").unwrap(),
            Some(ForkOrigin {
                origin_thread_id: Some("t1".into()),
                branch_name: Some("alt".into()),
            })
        );
        assert_eq!(
            CheckpointRepo::fork_origin(&conn, "root").unwrap(),
            Some(ForkOrigin {
                origin_thread_id: None,
                branch_name: None,
            })
        );
        assert!(!CheckpointRepo::branch_name_taken(&conn, "t2", "alt").unwrap());

        let err = CheckpointRepo::insert(&conn, &checkpoint("b2", "t1_alt2", Some("root"), 0, 2), &branch)
            .unwrap_err();
        assert_matches!(err, StoreError::Conflict(_));
    }

    #[test]
    fn dangling_parent_is_rejected_by_foreign_key() {
        let conn = setup();
        let err = CheckpointRepo::insert(
            &conn,
            &checkpoint("c1", "t1", Some("ghost"), 0, 0),
            &InsertCheckpoint::default(),
        )
        .unwrap_err();
        assert_matches!(err, StoreError::Conflict(_));
    }

    #[test]
    fn links_and_first_link() {
        let conn = setup();
        let none = InsertCheckpoint::default();
        CheckpointRepo::insert(&conn, &checkpoint("root", "t1", None, 0, 0), &none).unwrap();
        CheckpointRepo::insert(&conn, &checkpoint("seed", "t2", Some("root"), 0, 1), &none).unwrap();
        CheckpointRepo::insert(&conn, &checkpoint("next", "t2", Some("seed"), 1, 2), &none).unwrap();

        let first = CheckpointRepo::first_link(&conn, "t2").unwrap().unwrap();
        assert_eq!(first.checkpoint_id, "seed");
        assert_eq!(first.parent_checkpoint_id.as_deref(), Some("root"));
        let link = CheckpointRepo::get_link(&conn, "root").unwrap().unwrap();
        assert_eq!(link.thread_id, "t1");
        assert!(link.parent_checkpoint_id.is_none());
    }

    #[test]
    fn idempotency_key_lookup() {
        let conn = setup();
        let keyed = InsertCheckpoint {
            idempotency_key: Some("k1"),
            ..InsertCheckpoint::default()
        };
        CheckpointRepo::insert(&conn, &checkpoint("c1", "t1", None, 0, 0), &keyed).unwrap();
        let found = CheckpointRepo::get_by_idempotency_key(&conn, "k1").unwrap().unwrap();
        assert_eq!(found.checkpoint_id.as_str(), "c1");
        assert!(CheckpointRepo::get_by_idempotency_key(&conn, "k2").unwrap().is_none());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let conn = setup();
        conn.execute(
            "INSERT INTO checkpoints (checkpoint_id, thread_id, sequence, created_at, state)
             VALUES ('bad', 't1', 0, '2026-01-01T00:00:00.000000Z', '[1]')",
            [],
        )
        .unwrap();
        assert_matches!(
            CheckpointRepo::get_by_id(&conn, "bad"),
            Err(StoreError::CorruptRow { table: "checkpoints", column: "state", .. })
        );
    }
}
