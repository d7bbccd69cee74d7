//! Core data model.
//!
//! An entity snapshot is one poll's view of a single execution instance
//! (an Airflow DAG run or an Argo workflow). Snapshots are rebuilt on every
//! cycle and never mutated; the only thing that outlives a cycle is the
//! last observed [`RunState`] held in the dedup cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Which workflow engine a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Airflow,
    Argo,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Airflow => "airflow",
            Self::Argo => "argo",
        }
    }

    /// Synthetic request method tagged on root spans so traces group by engine.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Airflow => "AIRFLOW",
            Self::Argo => "ARGO",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Normalized lifecycle state of an execution instance or sub-record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Anything the source reports that has no normalized equivalent.
    Other(String),
}

impl RunState {
    /// Map an Airflow DAG run / task instance state.
    pub fn from_airflow(state: &str) -> Self {
        match state {
            "queued" | "scheduled" => Self::Queued,
            "running" | "restarting" | "deferred" | "up_for_retry" | "up_for_reschedule" => {
                Self::Running
            }
            "success" => Self::Succeeded,
            "failed" | "upstream_failed" => Self::Failed,
            "" => Self::Pending,
            other => Self::Other(other.to_string()),
        }
    }

    /// Map an Argo workflow or node phase. An empty phase means the
    /// controller has not picked the workflow up yet.
    pub fn from_argo(phase: &str) -> Self {
        match phase {
            "" | "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            "Error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    /// No further transition is expected from a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Error)
    }

    /// HTTP-like status code used to color traces by severity.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Succeeded => 200,
            Self::Queued | Self::Pending | Self::Running => 102,
            _ => 500,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

/// A scalar attribute value, usable both as a payload field and a span tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl TagValue {
    /// Convert a JSON value from a source API. Nulls are dropped; arrays and
    /// objects are kept as their serialized text.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::String(s) => Some(Self::Str(s.clone())),
            other => Some(Self::Str(other.to_string())),
        }
    }
}

impl From<&str> for TagValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for TagValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for TagValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for TagValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<DateTime<Utc>> for TagValue {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Str(t.to_rfc3339())
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A workflow argument. Argo parameters may be declared without a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Point-in-time view of one execution instance.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub source: SourceType,

    /// Source-scoped unique identifier; the dedup cache key.
    pub id: String,

    /// Raw name. Unique per run for Argo, the DAG id for Airflow.
    pub logical_name: String,

    /// Name of this specific run (Airflow `dag_run_id`, Argo workflow name).
    pub run_name: String,

    pub namespace: Option<String>,

    /// Resource kind reported by the source (`Workflow`, `DAGRun`).
    pub kind: String,

    /// Link to the run in the source UI, when one can be built.
    pub url: Option<String>,

    pub state: RunState,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,

    /// Generated-name prefix (Argo `metadata.generateName`), e.g. `"etl-"`.
    pub generate_name: Option<String>,

    pub parameters: Vec<Parameter>,

    /// Source-specific scalar attributes (run type, trigger flag, note...).
    pub details: BTreeMap<String, TagValue>,

    /// Child units of work, in source order.
    pub sub_records: Vec<SubRecord>,
}

impl EntitySnapshot {
    /// Minimal snapshot; remaining fields are filled by the source.
    pub fn new(
        source: SourceType,
        id: impl Into<String>,
        logical_name: impl Into<String>,
        state: RunState,
    ) -> Self {
        let logical_name = logical_name.into();
        Self {
            source,
            id: id.into(),
            run_name: logical_name.clone(),
            logical_name,
            namespace: None,
            kind: String::new(),
            url: None,
            state,
            created_at: None,
            started_at: None,
            finished_at: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            generate_name: None,
            parameters: Vec::new(),
            details: BTreeMap::new(),
            sub_records: Vec::new(),
        }
    }
}

/// A child unit of execution: an Airflow task instance or an Argo node.
#[derive(Debug, Clone)]
pub struct SubRecord {
    pub id: String,
    pub name: String,
    /// Id of the record this one depends on, if the source reports one.
    /// Informational; every sub-record is traced under the run span.
    pub parent_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    /// Free-form type tag (`dagTask`, `Pod`, `DAG`, ...).
    pub kind: String,
    /// Source metadata attached to the span as tags.
    pub metadata: BTreeMap<String, TagValue>,
}

impl SubRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: RunState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent_ref: None,
            started_at: None,
            finished_at: None,
            state,
            kind: String::new(),
            metadata: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Process identity
// ---------------------------------------------------------------------------

/// Process-wide identity values, resolved once at startup and passed by
/// value into every poller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub project_id: String,
    pub service_account_email: String,
    pub tenant: String,
    pub environment: String,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Treat timestamps at or before the Unix epoch as absent. Go-based sources
/// serialize unset times as `0001-01-01T00:00:00Z`.
pub fn non_zero(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (t.timestamp_micros() > 0).then_some(t)
}

/// Parse an RFC 3339 timestamp from a source API. Unparsable, empty and
/// zero-valued inputs all yield `None`.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(raw) {
        Ok(t) => non_zero(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::debug!(raw, error = %e, "unparsable timestamp");
            None
        }
    }
}
