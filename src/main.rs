//! `tracelens` command line: inspect, edit and fork recorded agent threads.
//!
//! Every command prints JSON on stdout. Logs go to stderr.

#![deny(unsafe_code)]

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracelens_core::{CheckpointId, Metadata, NewSpan, SpanClose, SpanId, State, ThreadId};
use tracelens_engine::{BranchRequest, Debugger, EngineError, ResumeRequest, StateUpdate};
use tracelens_settings::{load_settings, load_settings_from_path, TracelensSettings};
use tracelens_store::PutCheckpoint;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "tracelens", about = "Inspect and time-travel recorded agent executions")]
struct Cli {
    /// Settings file. Defaults to ~/.tracelens/settings.json.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Database file, overriding the settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List threads, most recently updated first.
    Threads,
    /// Execution graph reconstructed from a thread's spans.
    Graph { thread: String },
    /// Checkpoints of a thread in creation order.
    Checkpoints { thread: String },
    /// One checkpoint with its full state.
    Checkpoint { thread: String, checkpoint: String },
    /// Parent chain from the thread's root to its latest checkpoint.
    History { thread: String },
    /// Ancestors of a checkpoint across resumed and branched threads.
    Lineage { thread: String, checkpoint: String },
    /// Spans of a thread in start order.
    Spans { thread: String },
    /// Key-level state diff between two checkpoints.
    Diff {
        thread: String,
        from: String,
        to: String,
    },
    /// Checkpoints and span starts merged by time.
    Timeline { thread: String },
    /// Check a candidate state file against a checkpoint.
    Validate {
        thread: String,
        checkpoint: String,
        state_file: PathBuf,
    },
    /// Write an edited state as a child of a checkpoint.
    UpdateState {
        thread: String,
        checkpoint: String,
        state_file: PathBuf,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Seed a new thread from a checkpoint.
    Resume {
        thread: String,
        checkpoint: String,
        /// Replacement state for the seed checkpoint.
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Seed a named branch thread from a checkpoint.
    Branch {
        thread: String,
        checkpoint: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        state: Option<PathBuf>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Load checkpoint and span records from a JSON Lines file.
    Ingest { file: PathBuf },
}

/// One line of an ingest file.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IngestRecord {
    Checkpoint {
        thread_id: ThreadId,
        state: State,
        #[serde(default)]
        parent_checkpoint_id: Option<CheckpointId>,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default)]
        idempotency_key: Option<String>,
    },
    SpanOpen {
        thread_id: ThreadId,
        #[serde(flatten)]
        span: NewSpan,
    },
    SpanClose {
        span_id: SpanId,
        #[serde(flatten)]
        close: SpanClose,
    },
    Span {
        thread_id: ThreadId,
        #[serde(flatten)]
        span: NewSpan,
        #[serde(flatten)]
        close: SpanClose,
    },
}

#[derive(Debug, Default, PartialEq, Serialize)]
struct IngestSummary {
    lines: usize,
    checkpoints: usize,
    spans_opened: usize,
    spans_closed: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match resolve_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => return report_failure(&e),
    };
    // Commands still run when logging cannot be installed.
    let _telemetry = tracelens_telemetry::init_telemetry(&settings.logging).ok();

    match run(cli.command, &settings) {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => report_failure(&e.into()),
        },
        Err(e) => report_failure(&e),
    }
}

fn resolve_settings(cli: &Cli) -> Result<TracelensSettings> {
    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => load_settings().context("failed to load settings")?,
    };
    if let Some(db) = &cli.db {
        settings.database.path = db.clone();
    }
    Ok(settings)
}

fn report_failure(err: &anyhow::Error) -> ExitCode {
    let kind = err
        .downcast_ref::<EngineError>()
        .map_or("internal", |e| e.kind().as_str());
    let mut body = json!({ "error": kind, "message": format!("{err:#}") });
    if let Some(report) = err
        .downcast_ref::<EngineError>()
        .and_then(EngineError::validation_report)
    {
        body["validation"] = json!(report);
    }
    eprintln!("{body}");
    ExitCode::FAILURE
}

fn run(command: Command, settings: &TracelensSettings) -> Result<Value> {
    let debugger = Debugger::open(settings)
        .with_context(|| format!("failed to open {}", settings.database.path.display()))?;
    debug!(?command, "running command");

    let thread = |raw: &str| ThreadId::from_raw(raw);
    let checkpoint = |raw: &str| CheckpointId::from_raw(raw);

    let output = match command {
        Command::Threads => json!(debugger.list_threads()?),
        Command::Graph { thread: t } => json!(debugger.graph(&thread(&t))?),
        Command::Checkpoints { thread: t } => json!(debugger.list_checkpoints(&thread(&t))?),
        Command::Checkpoint {
            thread: t,
            checkpoint: c,
        } => json!(debugger.get_checkpoint(&thread(&t), &checkpoint(&c))?),
        Command::History { thread: t } => json!(debugger.history(&thread(&t))?),
        Command::Lineage {
            thread: t,
            checkpoint: c,
        } => json!(debugger.lineage(&thread(&t), &checkpoint(&c))?),
        Command::Spans { thread: t } => json!(debugger.list_spans(&thread(&t))?),
        Command::Diff { thread: t, from, to } => {
            json!(debugger.diff(&thread(&t), &checkpoint(&from), &checkpoint(&to))?)
        }
        Command::Timeline { thread: t } => json!(debugger.timeline(&thread(&t))?),
        Command::Validate {
            thread: t,
            checkpoint: c,
            state_file,
        } => {
            let text = read_text(&state_file)?;
            json!(debugger.validate_json(&thread(&t), &checkpoint(&c), &text)?)
        }
        Command::UpdateState {
            thread: t,
            checkpoint: c,
            state_file,
            description,
            idempotency_key,
        } => {
            let update = StateUpdate {
                state: read_json(&state_file)?,
                description,
                idempotency_key,
            };
            json!(debugger.update_state(&thread(&t), &checkpoint(&c), update)?)
        }
        Command::Resume {
            thread: t,
            checkpoint: c,
            state,
            description,
            idempotency_key,
        } => {
            let req = ResumeRequest {
                modified_state: state.as_deref().map(read_json).transpose()?,
                description,
                idempotency_key,
            };
            json!(debugger.resume(&thread(&t), &checkpoint(&c), req)?)
        }
        Command::Branch {
            thread: t,
            checkpoint: c,
            name,
            state,
            description,
            idempotency_key,
        } => {
            let req = BranchRequest {
                branch_name: name,
                modified_state: state.as_deref().map(read_json).transpose()?,
                description,
                idempotency_key,
            };
            json!(debugger.branch(&thread(&t), &checkpoint(&c), req)?)
        }
        Command::Ingest { file } => {
            let reader = BufReader::new(
                File::open(&file).with_context(|| format!("failed to open {}", file.display()))?,
            );
            let summary = ingest(&debugger, reader)?;
            info!(?summary, "ingest finished");
            json!(summary)
        }
    };
    Ok(output)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_json(path: &Path) -> Result<Value> {
    let text = read_text(path)?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Apply records in file order. Stops at the first failing line; earlier
/// lines stay committed.
fn ingest(debugger: &Debugger, reader: impl BufRead) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    for (index, line) in reader.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("failed to read line {line_no}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IngestRecord = serde_json::from_str(&line)
            .with_context(|| format!("line {line_no}: malformed record"))?;
        apply(debugger, record, &mut summary)
            .with_context(|| format!("line {line_no}: record rejected"))?;
        summary.lines += 1;
    }
    Ok(summary)
}

fn apply(
    debugger: &Debugger,
    record: IngestRecord,
    summary: &mut IngestSummary,
) -> std::result::Result<(), EngineError> {
    match record {
        IngestRecord::Checkpoint {
            thread_id,
            state,
            parent_checkpoint_id,
            metadata,
            idempotency_key,
        } => {
            let mut put = PutCheckpoint::new(state).with_metadata(metadata);
            if let Some(parent) = parent_checkpoint_id {
                put = put.with_parent(parent);
            }
            if let Some(key) = idempotency_key {
                put = put.with_idempotency_key(key);
            }
            debugger.put_checkpoint(&thread_id, put)?;
            summary.checkpoints += 1;
        }
        IngestRecord::SpanOpen { thread_id, span } => {
            debugger.open_span(&thread_id, span)?;
            summary.spans_opened += 1;
        }
        IngestRecord::SpanClose { span_id, close } => {
            debugger.close_span(&span_id, close)?;
            summary.spans_closed += 1;
        }
        IngestRecord::Span {
            thread_id,
            span,
            close,
        } => {
            debugger.record_span(&thread_id, span, close)?;
            summary.spans_opened += 1;
            summary.spans_closed += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tracelens_core::ErrorKind;
    use std::sync::Arc;
    use tracelens_settings::LimitSettings;
    use tracelens_store::TraceStore;

    fn debugger() -> Debugger {
        Debugger::new(
            Arc::new(TraceStore::in_memory().unwrap()),
            LimitSettings::default(),
        )
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_branch_flags() {
        let cli = Cli::try_parse_from([
            "tracelens", "--db", "/tmp/x.db", "branch", "t1", "cp_1", "--name", "alt",
        ])
        .unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        match cli.command {
            Command::Branch { thread, name, state, .. } => {
                assert_eq!(thread, "t1");
                assert_eq!(name.as_deref(), Some("alt"));
                assert!(state.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn ingest_applies_every_record_kind() {
        let dbg = debugger();
        let lines = r#"
{"type": "checkpoint", "thread_id": "t1", "state": {"step_count": 0, "query": "a"}}
{"type": "span_open", "thread_id": "t1", "trace_id": "tr", "span_id": "s1", "name": "agent.node.plan", "start_time": "2026-01-01T00:00:00Z"}
{"type": "span_close", "span_id": "s1", "end_time": "2026-01-01T00:00:01Z"}
{"type": "span", "thread_id": "t1", "trace_id": "tr", "span_id": "s2", "parent_span_id": "s1", "name": "agent.node.search", "start_time": "2026-01-01T00:00:01Z", "end_time": "2026-01-01T00:00:03Z", "status": "error"}
"#;
        let summary = ingest(&dbg, lines.as_bytes()).unwrap();
        assert_eq!(
            summary,
            IngestSummary {
                lines: 4,
                checkpoints: 1,
                spans_opened: 2,
                spans_closed: 2,
            }
        );

        let t1 = ThreadId::from_raw("t1");
        let graph = dbg.graph(&t1).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        let spans = dbg.list_spans(&t1).unwrap();
        assert_eq!(spans[1].duration, Some(2.0));
    }

    #[test]
    fn ingest_reports_failing_line() {
        let dbg = debugger();
        let lines = "{\"type\": \"span_close\", \"span_id\": \"missing\", \"end_time\": \"2026-01-01T00:00:01Z\"}\n";
        let err = ingest(&dbg, lines.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 1"));
        let kind = err.downcast_ref::<EngineError>().map(EngineError::kind);
        assert_eq!(kind, Some(ErrorKind::NotFound));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let dbg = debugger();
        let err = ingest(&dbg, "{\"type\": \"nope\"}\n".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("malformed record"));
    }
}
