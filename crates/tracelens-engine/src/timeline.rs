//! Merged chronological view of a thread's checkpoints and span starts.

use serde_json::Value;
use tracelens_core::timeline::{Timeline, TimelineEvent, TimelineEventType};
use tracelens_core::{Checkpoint, Span};
use tracelens_store::ThreadSnapshot;

/// Span attributes that name the graph node a span executed, in lookup order.
const NODE_ID_ATTRIBUTES: [&str; 2] = ["node.id", "langgraph.node"];

/// Events sorted by timestamp. At equal timestamps checkpoints come before
/// spans; otherwise input order (sequence, then span start order) holds.
pub fn build_timeline(snapshot: &ThreadSnapshot) -> Timeline {
    let mut events: Vec<TimelineEvent> = snapshot
        .checkpoints
        .iter()
        .map(checkpoint_event)
        .chain(snapshot.spans.iter().map(span_event))
        .collect();
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.event_type.cmp(&b.event_type))
    });

    Timeline {
        thread_id: snapshot.thread_id.clone(),
        total: events.len(),
        events,
    }
}

fn checkpoint_event(checkpoint: &Checkpoint) -> TimelineEvent {
    let description = match checkpoint.branch_name() {
        Some(branch) => format!("Checkpoint {} (branch {branch})", checkpoint.sequence),
        None => format!("Checkpoint {}", checkpoint.sequence),
    };
    TimelineEvent {
        event_id: format!("cp_{}", checkpoint.checkpoint_id),
        event_type: TimelineEventType::Checkpoint,
        timestamp: checkpoint.created_at,
        checkpoint_id: Some(checkpoint.checkpoint_id.clone()),
        span_id: None,
        node_id: None,
        description,
        metadata: checkpoint.metadata.clone(),
    }
}

fn span_event(span: &Span) -> TimelineEvent {
    let node_id = NODE_ID_ATTRIBUTES
        .iter()
        .find_map(|key| span.attributes.get(*key).and_then(Value::as_str))
        .map(str::to_string);
    TimelineEvent {
        event_id: format!("span_{}", span.span_id),
        event_type: TimelineEventType::Span,
        timestamp: span.start_time,
        checkpoint_id: None,
        span_id: Some(span.span_id.clone()),
        node_id,
        description: format!("Span: {}", span.name),
        metadata: span.attributes.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use tracelens_core::{CheckpointId, Metadata, SpanId, SpanStatus, StateSummary, ThreadId, TraceId};

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    fn checkpoint(id: &str, sequence: i64, secs: u32) -> Checkpoint {
        Checkpoint {
            checkpoint_id: CheckpointId::from_raw(id),
            thread_id: ThreadId::from_raw("t1"),
            parent_checkpoint_id: None,
            sequence,
            created_at: at(secs),
            state: Default::default(),
            state_summary: StateSummary::default(),
            metadata: Metadata::new(),
        }
    }

    fn span(id: &str, secs: u32, attributes: Value) -> Span {
        Span {
            trace_id: TraceId::from_raw("tr"),
            span_id: SpanId::from_raw(id),
            parent_span_id: None,
            thread_id: ThreadId::from_raw("t1"),
            name: format!("agent.node.{id}"),
            start_time: at(secs),
            end_time: None,
            duration: None,
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            status: SpanStatus::Ok,
        }
    }

    #[test]
    fn events_interleave_by_time() {
        let snapshot = ThreadSnapshot {
            thread_id: ThreadId::from_raw("t1"),
            checkpoints: vec![checkpoint("c0", 0, 1), checkpoint("c1", 1, 4)],
            spans: vec![span("a", 2, json!({})), span("b", 4, json!({}))],
        };
        let timeline = build_timeline(&snapshot);
        let ids: Vec<_> = timeline.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, ["cp_c0", "span_a", "cp_c1", "span_b"]);
        assert_eq!(timeline.total, 4);
        assert_eq!(timeline.events[1].description, "Span: agent.node.a");
        assert_eq!(timeline.events[0].description, "Checkpoint 0");
    }

    #[test]
    fn node_id_from_attributes() {
        let snapshot = ThreadSnapshot {
            thread_id: ThreadId::from_raw("t1"),
            checkpoints: vec![],
            spans: vec![
                span("a", 1, json!({"node.id": "plan", "langgraph.node": "other"})),
                span("b", 2, json!({"langgraph.node": "search"})),
                span("c", 3, json!({"node.id": 7})),
            ],
        };
        let timeline = build_timeline(&snapshot);
        let nodes: Vec<_> = timeline.events.iter().map(|e| e.node_id.as_deref()).collect();
        assert_eq!(nodes, [Some("plan"), Some("search"), None]);
    }

    #[test]
    fn serialized_events_omit_absent_ids() {
        let snapshot = ThreadSnapshot {
            thread_id: ThreadId::from_raw("t1"),
            checkpoints: vec![checkpoint("c0", 0, 1)],
            spans: vec![],
        };
        let json = serde_json::to_value(build_timeline(&snapshot)).unwrap();
        let event = &json["events"][0];
        assert_eq!(event["event_type"], "checkpoint");
        assert_eq!(event["checkpoint_id"], "c0");
        assert!(event.get("span_id").is_none());
        assert!(event.get("node_id").is_none());
    }
}
