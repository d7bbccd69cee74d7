//! Message bus seam.
//!
//! Publishing is fire-and-forget from the core's point of view: one call,
//! one message id back or an error. No ordering or exactly-once guarantee
//! is assumed.

pub mod pubsub;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Destination topic on the message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub project_id: String,
    pub name: String,
}

impl Topic {
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project_id, self.name)
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message and return the id the bus assigned to it.
    async fn publish(
        &self,
        topic: &Topic,
        payload: Vec<u8>,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String>;
}
