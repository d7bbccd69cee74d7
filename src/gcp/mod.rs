//! Google Compute Engine metadata server access.
//!
//! Project id and service-account email are resolved once at startup.
//! OAuth tokens for Pub/Sub and Cloud Composer come from the same server
//! through [`auth::TokenSource`]. Off GCE every lookup is skipped and the
//! identity values stay empty.

pub mod auth;

use crate::config::Config;
use crate::error::Result;
use crate::model::Identity;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

pub const METADATA_BASE: &str = "http://metadata.google.internal";

/// Token response from the metadata server.
#[derive(Debug, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

/// Thin client for `computeMetadata/v1`.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base: String,
}

impl MetadataClient {
    pub fn new() -> Result<Self> {
        Self::with_base(METADATA_BASE)
    }

    /// Point at a different metadata host (emulators, tests).
    pub fn with_base(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// True when the metadata server answers with the GCE flavor header.
    pub async fn on_gce(&self) -> bool {
        match self
            .http
            .get(&self.base)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
        {
            Ok(resp) => resp
                .headers()
                .get("Metadata-Flavor")
                .is_some_and(|v| v == "Google"),
            Err(_) => false,
        }
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}/computeMetadata/v1/{path}", self.base);
        let resp = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }

    pub async fn project_id(&self) -> Result<String> {
        Ok(self.get("project/project-id").await?.text().await?)
    }

    /// Email of the instance's default service account.
    pub async fn email(&self) -> Result<String> {
        Ok(self
            .get("instance/service-accounts/default/email")
            .await?
            .text()
            .await?)
    }

    pub async fn access_token(&self) -> Result<AccessToken> {
        Ok(self
            .get("instance/service-accounts/default/token")
            .await?
            .json()
            .await?)
    }
}

/// Resolve the process identity. Explicit config wins, then the metadata
/// server; anything unresolved stays empty.
pub async fn resolve_identity(config: &Config, metadata: &MetadataClient) -> Identity {
    let mut identity = Identity {
        project_id: config.project_id.clone().unwrap_or_default(),
        service_account_email: config.service_account_email.clone().unwrap_or_default(),
        tenant: config.tenant.clone(),
        environment: config.environment.clone(),
    };

    let needs_lookup =
        identity.project_id.is_empty() || identity.service_account_email.is_empty();
    if !needs_lookup {
        return identity;
    }
    if !metadata.on_gce().await {
        info!("not running on GCE, identity left unresolved");
        return identity;
    }

    if identity.project_id.is_empty() {
        match metadata.project_id().await {
            Ok(project_id) => identity.project_id = project_id,
            Err(e) => warn!(error = %e, "failed to resolve project id"),
        }
    }
    if identity.service_account_email.is_empty() {
        match metadata.email().await {
            Ok(email) => identity.service_account_email = email,
            Err(e) => warn!(error = %e, "failed to resolve service account email"),
        }
    }
    identity
}
