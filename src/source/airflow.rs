//! Airflow source over the stable REST API (`/api/v1`).
//!
//! DAG runs are listed one DAG at a time on purpose: the webserver rate
//! limits aggressively and the poll cadence is minutes, not seconds. Task
//! instances are only fetched for runs that are about to be traced.

use super::{ExclusionFilter, SnapshotSource, TimeWindow};
use crate::error::{Error, Result};
use crate::gcp::auth::TokenSource;
use crate::model::{
    EntitySnapshot, Parameter, RunState, SourceType, SubRecord, TagValue, parse_timestamp,
};
use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::Url;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 100;

/// Runs fetched per DAG per cycle.
const RUNS_PER_DAG: usize = 10;

#[derive(Debug, Deserialize)]
struct DagCollection {
    #[serde(default)]
    dags: Vec<Dag>,
    #[serde(default)]
    total_entries: usize,
}

#[derive(Debug, Deserialize)]
struct Dag {
    dag_id: String,
}

#[derive(Debug, Deserialize)]
struct DagRunCollection {
    #[serde(default)]
    dag_runs: Vec<DagRun>,
}

/// A DAG run as returned by `GET /dags/{dag_id}/dagRuns`.
#[derive(Debug, Clone, Deserialize)]
pub struct DagRun {
    pub dag_id: String,
    pub dag_run_id: String,
    pub logical_date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub data_interval_start: Option<String>,
    pub data_interval_end: Option<String>,
    pub last_scheduling_decision: Option<String>,
    pub run_type: Option<String>,
    pub state: Option<String>,
    #[serde(default)]
    pub external_trigger: bool,
    pub conf: Option<Map<String, Value>>,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskInstanceCollection {
    #[serde(default)]
    task_instances: Vec<Map<String, Value>>,
    #[serde(default)]
    total_entries: usize,
}

/// Polls one Airflow webserver.
pub struct AirflowSource {
    http: reqwest::Client,
    base: Url,
    host: String,
    tokens: Option<Arc<TokenSource>>,
}

impl AirflowSource {
    /// `host` may be a bare hostname (https is assumed) or a full base URL.
    pub fn new(host: &str, tokens: Option<Arc<TokenSource>>) -> Result<Self> {
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        let base = Url::parse(&base)
            .map_err(|e| Error::Config(format!("invalid airflow host {host}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            host: base.host_str().unwrap_or(host).to_string(),
            base,
            tokens,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("airflow base url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "v1"])
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T> {
        let mut request = self.http.get(url).query(query);
        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            request = request.bearer_auth(token.expose_secret());
        }
        let resp = request.send().await?.error_for_status()?;
        Ok(resp.json().await?)
    }

    async fn list_dags(&self) -> Result<Vec<Dag>> {
        let url = self.url(&["dags"])?;
        let mut dags = Vec::new();
        loop {
            let page: DagCollection = self
                .get_json(
                    url.clone(),
                    &[
                        ("only_active", "true".to_string()),
                        ("limit", PAGE_SIZE.to_string()),
                        ("offset", dags.len().to_string()),
                    ],
                )
                .await?;
            let fetched = page.dags.len();
            dags.extend(page.dags);
            if fetched == 0 || dags.len() >= page.total_entries {
                return Ok(dags);
            }
        }
    }

    async fn list_runs(&self, dag_id: &str, window: &TimeWindow) -> Result<Vec<DagRun>> {
        let since = window.since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let page: DagRunCollection = self
            .get_json(
                self.url(&["dags", dag_id, "dagRuns"])?,
                &[
                    ("limit", RUNS_PER_DAG.to_string()),
                    ("start_date_gte", since.clone()),
                    ("end_date_gte", since),
                ],
            )
            .await?;
        Ok(page.dag_runs)
    }

    async fn task_instances(&self, dag_id: &str, dag_run_id: &str) -> Result<Vec<Map<String, Value>>> {
        let url = self.url(&["dags", dag_id, "dagRuns", dag_run_id, "taskInstances"])?;
        let mut tasks = Vec::new();
        loop {
            let page: TaskInstanceCollection = self
                .get_json(
                    url.clone(),
                    &[
                        ("limit", PAGE_SIZE.to_string()),
                        ("offset", tasks.len().to_string()),
                    ],
                )
                .await?;
            let fetched = page.task_instances.len();
            tasks.extend(page.task_instances);
            if fetched == 0 || tasks.len() >= page.total_entries {
                return Ok(tasks);
            }
        }
    }

    /// Link to the DAG in the Airflow UI.
    pub fn dag_url(&self, dag_id: &str) -> String {
        format!("https://{}/dags/{dag_id}", self.host)
    }

    /// Convert an API DAG run into a snapshot.
    pub fn snapshot(&self, run: DagRun) -> EntitySnapshot {
        let mut snapshot = EntitySnapshot::new(
            SourceType::Airflow,
            format!("{}/{}", run.dag_id, run.dag_run_id),
            run.dag_id.clone(),
            RunState::from_airflow(run.state.as_deref().unwrap_or_default()),
        );
        snapshot.run_name = run.dag_run_id.clone();
        snapshot.kind = "DAGRun".to_string();
        snapshot.url = Some(self.dag_url(&run.dag_id));
        snapshot.started_at = parse_timestamp(run.start_date.as_deref());
        snapshot.finished_at = parse_timestamp(run.end_date.as_deref());
        snapshot.parameters = run
            .conf
            .iter()
            .flatten()
            .map(|(name, value)| Parameter {
                name: name.clone(),
                value: match value {
                    Value::Null => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                },
            })
            .collect();

        let details = &mut snapshot.details;
        if let Some(state) = run.state.filter(|s| !s.is_empty()) {
            details.insert("source_state".into(), state.into());
        }
        details.insert("dag_id".into(), run.dag_id.into());
        details.insert("dag_run_id".into(), run.dag_run_id.into());
        for (key, raw) in [
            ("logical_date", &run.logical_date),
            ("start_date", &run.start_date),
            ("end_date", &run.end_date),
            ("data_interval_start", &run.data_interval_start),
            ("data_interval_end", &run.data_interval_end),
            ("last_scheduling_decision", &run.last_scheduling_decision),
        ] {
            if let Some(t) = parse_timestamp(raw.as_deref()) {
                details.insert(key.into(), TagValue::Int(t.timestamp_micros()));
            }
        }
        if let Some(run_type) = run.run_type {
            details.insert("run_type".into(), run_type.into());
        }
        details.insert("external_trigger".into(), run.external_trigger.into());
        if let Some(note) = run.note.filter(|n| !n.is_empty()) {
            details.insert("note".into(), note.into());
        }
        snapshot
    }
}

/// Convert one task instance into a sub-record. Every non-null API field is
/// kept as a tag.
pub fn task_sub_record(task: &Map<String, Value>) -> SubRecord {
    let field = |key: &str| task.get(key).and_then(Value::as_str);
    let task_id = field("task_id").unwrap_or_default();
    let id = match task.get("map_index").and_then(Value::as_i64) {
        Some(index) if index >= 0 => format!("{task_id}[{index}]"),
        _ => task_id.to_string(),
    };

    let mut record = SubRecord::new(
        id,
        task_id,
        RunState::from_airflow(field("state").unwrap_or_default()),
    );
    record.kind = "dagTask".to_string();
    record.started_at = parse_timestamp(field("start_date"));
    record.finished_at = parse_timestamp(field("end_date"));
    record.metadata = task
        .iter()
        .filter_map(|(key, value)| TagValue::from_json(value).map(|v| (key.clone(), v)))
        .collect();
    record
}

#[async_trait]
impl SnapshotSource for AirflowSource {
    fn source_type(&self) -> SourceType {
        SourceType::Airflow
    }

    async fn fetch(
        &self,
        window: &TimeWindow,
        filter: &ExclusionFilter,
    ) -> Result<Vec<EntitySnapshot>> {
        let dags = self
            .list_dags()
            .await
            .map_err(|e| Error::Fetch(format!("airflow {}: listing dags: {e}", self.host)))?;
        debug!(source = "airflow", dags = dags.len(), "listed active dags");

        let mut snapshots = Vec::new();
        for dag in dags.iter().filter(|d| !filter.excludes(&d.dag_id)) {
            match self.list_runs(&dag.dag_id, window).await {
                Ok(runs) => snapshots.extend(runs.into_iter().map(|run| self.snapshot(run))),
                Err(e) => {
                    warn!(source = "airflow", dag_id = %dag.dag_id, error = %e, "failed to list dag runs")
                }
            }
        }
        Ok(snapshots)
    }

    async fn sub_records(&self, snapshot: &EntitySnapshot) -> Result<Vec<SubRecord>> {
        let tasks = self
            .task_instances(&snapshot.logical_name, &snapshot.run_name)
            .await
            .map_err(|e| Error::Fetch(format!("airflow {}: task instances: {e}", snapshot.id)))?;
        Ok(tasks.iter().map(task_sub_record).collect())
    }
}
