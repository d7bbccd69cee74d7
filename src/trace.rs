//! Trace reconstruction for finished runs.
//!
//! [`build_trace`] turns one terminal snapshot into a three-level span tree:
//! a root span for the entity, one span for the run, and one leaf per
//! sub-record directly beneath the run, in source order. Sub-record
//! linkage (upstream node, children) travels as tags only. Everything is
//! built and closed in a single pass from recorded timestamps; nothing
//! waits on live work.

use chrono::{DateTime, Utc};
use opentelemetry_semantic_conventions::attribute::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_FULL,
};
use std::collections::BTreeMap;

use crate::model::{EntitySnapshot, Identity, RunState, SourceType, SubRecord, TagValue};

/// One finished span with explicit timing.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanNode {
    /// Operation name.
    pub name: String,
    pub resource: Option<String>,
    pub service: Option<String>,
    pub span_type: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub error: bool,
    pub tags: BTreeMap<String, TagValue>,
    pub children: Vec<SpanNode>,
}

impl SpanNode {
    fn new(name: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            service: None,
            span_type: None,
            start,
            end: end.max(start),
            error: false,
            tags: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    fn tag(&mut self, key: &str, value: impl Into<TagValue>) {
        self.tags.insert(key.to_string(), value.into());
    }

    fn tag_time(&mut self, key: &str, value: Option<DateTime<Utc>>) {
        if let Some(t) = value {
            self.tag(key, t);
        }
    }

    /// Number of spans in this subtree, this one included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SpanNode::count).sum::<usize>()
    }
}

/// A root span and everything beneath it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanTree {
    pub root: SpanNode,
}

impl SpanTree {
    pub fn span_count(&self) -> usize {
        self.root.count()
    }

    /// The span for the run itself, the root's only child.
    pub fn run_span(&self) -> Option<&SpanNode> {
        self.root.children.first()
    }
}

/// Where finished span trees go.
pub trait TraceSink: Send + Sync {
    fn export(&self, source: SourceType, tree: &SpanTree);
}

fn root_operation(source: SourceType) -> &'static str {
    match source {
        SourceType::Airflow => "airflow.dagrun",
        SourceType::Argo => "argo_workflow",
    }
}

fn run_span_type(source: SourceType) -> &'static str {
    match source {
        SourceType::Airflow => "airflow_dagrun",
        SourceType::Argo => "argo_workflow",
    }
}

fn is_failure(state: &RunState) -> bool {
    state.status_code() >= 500
}

/// Build the span tree for a terminal snapshot.
pub fn build_trace(
    snapshot: &EntitySnapshot,
    normalized_name: &str,
    identity: &Identity,
) -> SpanTree {
    let root_start = snapshot
        .created_at
        .or(snapshot.started_at)
        .or(snapshot.finished_at)
        .unwrap_or_else(Utc::now);
    let run_start = snapshot.started_at.unwrap_or(root_start);
    let end = snapshot.finished_at.unwrap_or(run_start).max(run_start);

    let mut root = SpanNode::new(root_operation(snapshot.source), root_start, end);
    root.resource = Some(normalized_name.to_string());
    root.error = is_failure(&snapshot.state);
    root.tag(
        HTTP_RESPONSE_STATUS_CODE,
        i64::from(snapshot.state.status_code()),
    );
    root.tag(HTTP_REQUEST_METHOD, snapshot.source.method());
    root.tag("tenant", identity.tenant.as_str());
    if let Some(url) = &snapshot.url {
        root.tag(URL_FULL, url.as_str());
        root.tag("url", url.as_str());
    }

    let mut run = run_span(snapshot, normalized_name, run_start, end);
    run.children = snapshot
        .sub_records
        .iter()
        .map(|record| leaf_span(record, normalized_name, &run))
        .collect();
    root.children.push(run);

    SpanTree { root }
}

fn run_span(
    snapshot: &EntitySnapshot,
    normalized_name: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> SpanNode {
    let mut span = SpanNode::new(snapshot.run_name.clone(), start, end);
    span.service = Some(normalized_name.to_string());
    span.resource = Some(snapshot.run_name.clone());
    span.span_type = Some(run_span_type(snapshot.source).to_string());
    span.error = is_failure(&snapshot.state);

    span.tag("component", snapshot.source.as_str());
    span.tag("id", snapshot.id.as_str());
    span.tag("name", snapshot.logical_name.as_str());
    span.tag("state", snapshot.state.as_str());
    if !snapshot.kind.is_empty() {
        span.tag("kind", snapshot.kind.as_str());
    }
    if let Some(ns) = &snapshot.namespace {
        span.tag("namespace", ns.as_str());
    }
    if let Some(prefix) = &snapshot.generate_name {
        span.tag("generate_name", prefix.as_str());
    }
    span.tag_time("created_at", snapshot.created_at);
    span.tag_time("started_at", snapshot.started_at);
    span.tag_time("finished_at", snapshot.finished_at);
    for param in &snapshot.parameters {
        if let Some(value) = &param.value {
            span.tag(&format!("parameter.{}", param.name), value.as_str());
        }
    }
    for (key, value) in &snapshot.details {
        span.tags.insert(key.clone(), value.clone());
    }
    span
}

fn leaf_span(record: &SubRecord, component: &str, parent: &SpanNode) -> SpanNode {
    // Missing times borrow the parent's so the span can always be closed.
    let start = record.started_at.unwrap_or(parent.start);
    let end = record.finished_at.unwrap_or(parent.end);

    let mut span = SpanNode::new(record.name.clone(), start, end);
    span.resource = Some(record.name.clone());
    span.error = matches!(record.state, RunState::Failed | RunState::Error);

    for (key, value) in &record.metadata {
        span.tags.insert(key.clone(), value.clone());
    }
    span.tag("component", component);
    span.tag("span.kind", "consumer");
    span.tag("state", record.state.as_str());
    if !record.kind.is_empty() {
        span.tag("operation.name", record.kind.as_str());
    }
    if let Some(parent_ref) = &record.parent_ref {
        span.tag("parent", parent_ref.as_str());
    }
    span.tag_time("started", record.started_at);
    span.tag_time("finished", record.finished_at);
    span
}
