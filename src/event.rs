//! Normalized events published once per detected state transition.
//!
//! The payload is a flat JSON object: nested structures (labels,
//! annotations, parameters) travel as embedded JSON text, and timestamps the
//! source never set are omitted rather than sent as epoch zero.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;
use crate::model::{EntitySnapshot, Identity, SourceType, TagValue};
use crate::publish::{Publisher, Topic};

/// Wire payload for one state transition.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub source_type: SourceType,
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    pub run_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_template: Option<String>,
    /// JSON text of the label map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    /// JSON text of the annotation map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<String>,
    /// JSON text of the parameter list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    /// Unix microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(flatten)]
    pub details: BTreeMap<String, TagValue>,
}

fn micros(t: Option<DateTime<Utc>>) -> Option<i64> {
    t.map(|t| t.timestamp_micros())
}

fn embedded_map(map: &BTreeMap<String, String>) -> Result<Option<String>> {
    if map.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(map)?))
}

impl Event {
    pub fn from_snapshot(snapshot: &EntitySnapshot, normalized_name: &str) -> Result<Self> {
        let parameters = if snapshot.parameters.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&snapshot.parameters)?)
        };

        Ok(Self {
            source_type: snapshot.source,
            id: snapshot.id.clone(),
            name: snapshot.logical_name.clone(),
            normalized_name: normalized_name.to_string(),
            run_name: snapshot.run_name.clone(),
            namespace: snapshot.namespace.clone(),
            kind: snapshot.kind.clone(),
            url: snapshot.url.clone(),
            state: snapshot.state.to_string(),
            workflow_template: snapshot
                .labels
                .get(crate::identity::TEMPLATE_LABEL)
                .cloned(),
            labels: embedded_map(&snapshot.labels)?,
            annotations: embedded_map(&snapshot.annotations)?,
            parameters,
            creation_timestamp: micros(snapshot.created_at),
            started_at: micros(snapshot.started_at),
            finished_at: micros(snapshot.finished_at),
            details: snapshot.details.clone(),
        })
    }
}

/// A serialized event plus the message-bus attributes that travel with it.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

/// Attributes attached to every message from this process.
pub fn attributes(source: SourceType, identity: &Identity) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("project_id".to_string(), identity.project_id.clone()),
        ("sa_email".to_string(), identity.service_account_email.clone()),
        ("type".to_string(), source.as_str().to_string()),
        ("tenant".to_string(), identity.tenant.clone()),
        ("environment".to_string(), identity.environment.clone()),
    ])
}

/// Build the payload and attribute set for a snapshot.
///
/// # Errors
///
/// Returns [`crate::error::Error::Serialization`] if any part of the
/// snapshot cannot be encoded.
pub fn build_event(
    snapshot: &EntitySnapshot,
    normalized_name: &str,
    identity: &Identity,
) -> Result<OutboundMessage> {
    let event = Event::from_snapshot(snapshot, normalized_name)?;
    Ok(OutboundMessage {
        payload: serde_json::to_vec(&event)?,
        attributes: attributes(snapshot.source, identity),
    })
}

/// Turns snapshots into published messages.
///
/// The emitter never retries. A failed publish surfaces as `Err`, the caller
/// leaves its dedup cache untouched, and the next poll tries again.
#[derive(Clone)]
pub struct Emitter {
    publisher: Arc<dyn Publisher>,
    topic: Topic,
    identity: Identity,
}

impl Emitter {
    pub fn new(publisher: Arc<dyn Publisher>, topic: Topic, identity: Identity) -> Self {
        Self {
            publisher,
            topic,
            identity,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Build and publish one event. Returns the message id assigned by the
    /// bus.
    pub async fn emit(&self, snapshot: &EntitySnapshot, normalized_name: &str) -> Result<String> {
        let message = build_event(snapshot, normalized_name, &self.identity)?;
        self.publisher
            .publish(&self.topic, message.payload, &message.attributes)
            .await
    }
}
