//! Execution graph reconstruction.
//!
//! Every span becomes a node. Agent spans are chained in execution order;
//! tool spans hang off the node that invoked them. The builder is pure and
//! works on a [`ThreadSnapshot`], so it never observes a half-written thread.

use std::collections::HashSet;

use serde_json::{json, Value};
use tracelens_core::graph::{
    GraphEdge, GraphMetadata, GraphNode, GraphResponse, NodeStatus, NodeType, EXECUTION_LABEL,
};
use tracelens_core::{Metadata, Span, SpanStatus};
use tracelens_store::ThreadSnapshot;

/// Span name prefix for graph nodes run by the agent runtime.
pub const AGENT_NODE_PREFIX: &str = "agent.node.";
/// Span name prefix for tool invocations.
pub const TOOL_NODE_PREFIX: &str = "agent.tool.";
/// Span attribute that pins the node type, overriding the name prefix.
pub const NODE_TYPE_ATTRIBUTE: &str = "tracelens.node_type";
/// Condition recorded on execution edges.
pub const EXECUTION_CONDITION: &str = "next";

pub fn build_graph(snapshot: &ThreadSnapshot) -> GraphResponse {
    let nodes: Vec<GraphNode> = snapshot.spans.iter().map(node_for).collect();
    let edges = edges_for(&snapshot.spans, &nodes);

    GraphResponse {
        metadata: metadata_for(snapshot),
        nodes,
        edges,
    }
}

/// Classify a span. An explicit `tracelens.node_type` of `"tool"` or
/// `"agent"` wins over the name prefix.
pub fn classify(span: &Span) -> NodeType {
    match span.attributes.get(NODE_TYPE_ATTRIBUTE).and_then(Value::as_str) {
        Some("tool") => NodeType::ToolNode,
        Some("agent") => NodeType::AgentNode,
        _ if span.name.starts_with(TOOL_NODE_PREFIX) => NodeType::ToolNode,
        _ => NodeType::AgentNode,
    }
}

/// Display label: the span name without its node prefix.
pub fn label_for(name: &str) -> &str {
    name.strip_prefix(AGENT_NODE_PREFIX)
        .or_else(|| name.strip_prefix(TOOL_NODE_PREFIX))
        .unwrap_or(name)
}

fn status_for(span: &Span) -> NodeStatus {
    if span.is_open() {
        return NodeStatus::Active;
    }
    let attribute_error = span
        .attributes
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| s.to_ascii_lowercase().contains("error"));
    if span.status == SpanStatus::Error || attribute_error {
        NodeStatus::Failed
    } else {
        NodeStatus::Completed
    }
}

fn node_for(span: &Span) -> GraphNode {
    let mut metadata = Metadata::new();
    metadata.insert("span_id".into(), json!(span.span_id));
    metadata.insert("trace_id".into(), json!(span.trace_id));
    metadata.insert("parent_span_id".into(), json!(span.parent_span_id));
    metadata.insert("attributes".into(), Value::Object(span.attributes.clone()));

    GraphNode {
        id: span.span_id.as_str().to_string(),
        label: label_for(&span.name).to_string(),
        node_type: classify(span),
        status: status_for(span),
        timestamp: Some(span.start_time),
        duration: span.duration,
        metadata,
    }
}

/// Spans arrive ordered by start time. Agent spans link from their parent
/// node when it exists, else from the previous agent span. Tool spans link
/// from the same place but carry the tool name instead of an execution
/// label, since no agent step was traversed.
fn edges_for(spans: &[Span], nodes: &[GraphNode]) -> Vec<GraphEdge> {
    let node_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut edges = Vec::new();
    let mut previous_agent: Option<&str> = None;

    for (span, node) in spans.iter().zip(nodes) {
        let target = node.id.as_str();
        let parent = span
            .parent_span_id
            .as_ref()
            .map(|p| p.as_str())
            .filter(|p| node_ids.contains(p));
        let source = parent.or(previous_agent);

        let edge = source.map(|source| match node.node_type {
            NodeType::AgentNode => GraphEdge {
                source: source.to_string(),
                target: target.to_string(),
                condition: Some(EXECUTION_CONDITION.to_string()),
                label: Some(EXECUTION_LABEL.to_string()),
            },
            NodeType::ToolNode => GraphEdge {
                source: source.to_string(),
                target: target.to_string(),
                condition: None,
                label: Some(node.label.clone()),
            },
        });

        if node.node_type == NodeType::AgentNode {
            previous_agent = Some(target);
        }

        let Some(edge) = edge else { continue };
        if edge.source == edge.target
            || !node_ids.contains(edge.source.as_str())
            || !seen.insert((edge.source.clone(), edge.target.clone()))
        {
            continue;
        }
        edges.push(edge);
    }

    edges
}

fn metadata_for(snapshot: &ThreadSnapshot) -> GraphMetadata {
    let start_time = snapshot
        .spans
        .iter()
        .map(|s| s.start_time)
        .chain(snapshot.checkpoints.iter().map(|c| c.created_at))
        .min();

    let end_time = if snapshot.spans.iter().any(Span::is_open) {
        None
    } else if snapshot.spans.is_empty() {
        snapshot.checkpoints.iter().map(|c| c.created_at).max()
    } else {
        snapshot.spans.iter().filter_map(|s| s.end_time).max()
    };

    GraphMetadata {
        thread_id: snapshot.thread_id.clone(),
        start_time,
        end_time,
        total_checkpoints: snapshot.checkpoints.len(),
        total_spans: snapshot.spans.len(),
    }
}
