//! Argo Workflows source over the argo-server HTTP API.

use super::{ExclusionFilter, SnapshotSource, TimeWindow};
use crate::error::{Error, Result};
use crate::model::{
    EntitySnapshot, Parameter, RunState, SourceType, SubRecord, TagValue, parse_timestamp,
};
use async_trait::async_trait;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct WorkflowList {
    #[serde(default)]
    items: Option<Vec<Workflow>>,
    #[serde(default)]
    metadata: ListMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ListMeta {
    #[serde(rename = "continue", default)]
    continue_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    pub generate_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub creation_timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    #[serde(default)]
    pub phase: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub phase: String,
    pub template_name: Option<String>,
    #[serde(rename = "boundaryID")]
    pub boundary_id: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub message: Option<String>,
}

/// A workflow as returned by `GET /api/v1/workflows/{namespace}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

/// Polls one argo-server.
pub struct ArgoSource {
    http: reqwest::Client,
    base: Url,
    namespace: String,
    token: Option<SecretString>,
    ui_url: Option<String>,
}

impl ArgoSource {
    /// An empty `namespace` lists workflows across all namespaces the token
    /// can see.
    pub fn new(
        server: &str,
        namespace: &str,
        token: Option<SecretString>,
        ui_url: Option<String>,
    ) -> Result<Self> {
        let base = Url::parse(server)
            .map_err(|e| Error::Config(format!("invalid argo server {server}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base,
            namespace: namespace.to_string(),
            token,
            ui_url: ui_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    fn list_url(&self) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("argo server url cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "v1", "workflows", self.namespace.as_str()]);
        Ok(url)
    }

    /// Page through every workflow in the namespace.
    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let url = self.list_url()?;
        let mut workflows = Vec::new();
        let mut continue_token: Option<String> = None;
        loop {
            let mut request = self.http.get(url.clone());
            if let Some(token) = &continue_token {
                request = request.query(&[("listOptions.continue", token)]);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token.expose_secret());
            }
            let page: WorkflowList = request.send().await?.error_for_status()?.json().await?;
            workflows.extend(page.items.unwrap_or_default());
            match page.metadata.continue_token.filter(|c| !c.is_empty()) {
                Some(next) => continue_token = Some(next),
                None => return Ok(workflows),
            }
        }
    }

    pub fn workflow_url(&self, workflow: &Workflow) -> Option<String> {
        self.ui_url.as_ref().map(|base| {
            format!(
                "{base}/workflows/{}/{}",
                workflow.metadata.namespace, workflow.metadata.name
            )
        })
    }

    /// Convert an API workflow into a snapshot.
    pub fn snapshot(&self, workflow: Workflow) -> EntitySnapshot {
        let url = self.workflow_url(&workflow);
        let Workflow {
            metadata,
            spec,
            status,
        } = workflow;

        let mut snapshot = EntitySnapshot::new(
            SourceType::Argo,
            metadata.uid.clone(),
            metadata.name.clone(),
            RunState::from_argo(&status.phase),
        );
        snapshot.namespace = Some(metadata.namespace).filter(|ns| !ns.is_empty());
        snapshot.kind = "Workflow".to_string();
        snapshot.url = url;
        snapshot.created_at = parse_timestamp(metadata.creation_timestamp.as_deref());
        snapshot.started_at = parse_timestamp(status.started_at.as_deref());
        snapshot.finished_at = parse_timestamp(status.finished_at.as_deref());
        snapshot.generate_name = metadata.generate_name;
        snapshot.parameters = spec.arguments.parameters;
        snapshot.details.insert("uid".into(), metadata.uid.into());
        if !status.phase.is_empty() {
            snapshot
                .details
                .insert("phase".into(), status.phase.clone().into());
            snapshot
                .details
                .insert("source_state".into(), status.phase.into());
        }
        if let Some(completed) = metadata.labels.get("workflows.argoproj.io/completed") {
            snapshot
                .details
                .insert("completed".into(), TagValue::Str(completed.clone()));
        }
        snapshot.labels = metadata.labels;
        snapshot.annotations = metadata.annotations;
        snapshot.sub_records = node_sub_records(&status.nodes);
        snapshot
    }
}

/// Flatten workflow nodes into sub-records, in node-map order. `parent_ref`
/// names the first node that lists this one among its children; it is
/// carried as a tag and does not nest spans.
pub fn node_sub_records(nodes: &BTreeMap<String, NodeStatus>) -> Vec<SubRecord> {
    let mut parents: HashMap<&str, &str> = HashMap::new();
    for (key, node) in nodes {
        let id = if node.id.is_empty() { key.as_str() } else { node.id.as_str() };
        for child in &node.children {
            parents.entry(child.as_str()).or_insert(id);
        }
    }

    nodes
        .iter()
        .map(|(key, node)| {
            let id = if node.id.is_empty() { key.clone() } else { node.id.clone() };
            let display = if node.display_name.is_empty() {
                node.name.clone()
            } else {
                node.display_name.clone()
            };
            let mut record = SubRecord::new(id.clone(), display, RunState::from_argo(&node.phase));
            record.parent_ref = parents.get(id.as_str()).map(|p| p.to_string());
            record.kind = node.node_type.clone();
            record.started_at = parse_timestamp(node.started_at.as_deref());
            record.finished_at = parse_timestamp(node.finished_at.as_deref());

            let meta = &mut record.metadata;
            meta.insert("node_name".into(), node.name.clone().into());
            meta.insert("phase".into(), node.phase.clone().into());
            if let Some(boundary) = &node.boundary_id {
                meta.insert("boundary_id".into(), boundary.clone().into());
            }
            if !node.children.is_empty() {
                meta.insert("children".into(), node.children.join(",").into());
            }
            if let Some(template) = &node.template_name {
                meta.insert("template_name".into(), template.clone().into());
            }
            if let Some(message) = node.message.as_ref().filter(|m| !m.is_empty()) {
                meta.insert("message".into(), message.clone().into());
            }
            record
        })
        .collect()
}

/// Keep workflows created or finished inside the window.
pub fn active_in_window(workflow: &Workflow, window: &TimeWindow) -> bool {
    window.contains(parse_timestamp(workflow.metadata.creation_timestamp.as_deref()))
        || window.contains(parse_timestamp(workflow.status.finished_at.as_deref()))
}

#[async_trait]
impl SnapshotSource for ArgoSource {
    fn source_type(&self) -> SourceType {
        SourceType::Argo
    }

    async fn fetch(
        &self,
        window: &TimeWindow,
        filter: &ExclusionFilter,
    ) -> Result<Vec<EntitySnapshot>> {
        let workflows = self.list_workflows().await.map_err(|e| {
            Error::Fetch(format!("argo {}: listing workflows: {e}", self.base))
        })?;
        let listed = workflows.len();
        let snapshots: Vec<EntitySnapshot> = workflows
            .into_iter()
            .filter(|wf| active_in_window(wf, window) && !filter.excludes(&wf.metadata.name))
            .map(|wf| self.snapshot(wf))
            .collect();
        debug!(source = "argo", listed, active = snapshots.len(), "listed workflows");
        Ok(snapshots)
    }
}
