//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on anything missing or malformed.
//! Sensitive values are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::dedup::DEFAULT_TTL;
use crate::error::{Error, Result};
use crate::publish::pubsub::DEFAULT_ENDPOINT;
use crate::source::ExclusionFilter;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use std::time::Duration;
use tracing::error;

/// Where Kubernetes mounts the pod's service-account token.
pub const IN_CLUSTER_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Per-source polling cadence.
#[derive(Debug, Clone)]
pub struct PollSettings {
    /// Sleep between cycles.
    pub interval: Duration,
    /// Trailing window each fetch covers.
    pub window: Duration,
    pub exclude: ExclusionFilter,
}

#[derive(Debug, Clone)]
pub struct AirflowConfig {
    pub host: String,
    pub poll: PollSettings,
}

#[derive(Debug)]
pub struct ArgoConfig {
    pub server: String,
    pub namespace: String,
    pub token: Option<SecretString>,
    pub ui_url: Option<String>,
    pub poll: PollSettings,
}

#[derive(Debug)]
pub struct Config {
    pub airflow: Option<AirflowConfig>,
    pub argo: Option<ArgoConfig>,
    pub cache_ttl: Duration,
    pub project_id: Option<String>,
    pub service_account_email: Option<String>,
    pub topic_project_id: Option<String>,
    pub topic: String,
    pub pubsub_endpoint: String,
    pub tenant: String,
    pub environment: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub json_logs: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let airflow = if flag(&var, "FARM_AIRFLOW")? {
            let host = var("FARM_AIRFLOW_HOST")
                .ok_or_else(|| Error::Config("FARM_AIRFLOW_HOST must be set when FARM_AIRFLOW is enabled".into()))?;
            Some(AirflowConfig {
                host,
                poll: PollSettings {
                    interval: seconds(&var, "FARM_AIRFLOW_INTERVAL_SECS", 311)?,
                    window: seconds(&var, "FARM_AIRFLOW_WINDOW_SECS", 600)?,
                    exclude: exclusion(
                        "FARM_AIRFLOW_EXCLUDE",
                        Some(var("FARM_AIRFLOW_EXCLUDE").unwrap_or_else(|| "airflow_monitoring".into())),
                    )?,
                },
            })
        } else {
            None
        };

        let argo = if flag(&var, "FARM_ARGO")? {
            let server = var("FARM_ARGO_SERVER")
                .ok_or_else(|| Error::Config("FARM_ARGO_SERVER must be set when FARM_ARGO is enabled".into()))?;
            Some(ArgoConfig {
                server,
                namespace: var("FARM_ARGO_NAMESPACE").unwrap_or_default(),
                token: var("FARM_ARGO_TOKEN").map(SecretString::from),
                ui_url: var("FARM_ARGO_UI_URL"),
                poll: PollSettings {
                    interval: seconds(&var, "FARM_ARGO_INTERVAL_SECS", 191)?,
                    window: seconds(&var, "FARM_ARGO_WINDOW_SECS", 600)?,
                    exclude: exclusion("FARM_ARGO_EXCLUDE", var("FARM_ARGO_EXCLUDE"))?,
                },
            })
        } else {
            None
        };

        if airflow.is_none() && argo.is_none() {
            return Err(Error::Config(
                "no source enabled: set FARM_AIRFLOW and/or FARM_ARGO".into(),
            ));
        }

        Ok(Self {
            airflow,
            argo,
            cache_ttl: seconds(&var, "FARM_CACHE_TTL_SECS", DEFAULT_TTL.as_secs())?,
            project_id: var("FARM_PROJECT_ID"),
            service_account_email: var("FARM_SA_EMAIL"),
            topic_project_id: var("FARM_TOPIC_PROJECT_ID"),
            topic: var("FARM_TOPIC").unwrap_or_else(|| "farm".into()),
            pubsub_endpoint: var("FARM_PUBSUB_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.into()),
            tenant: var("tenant").unwrap_or_default(),
            environment: var("DD_ENV").unwrap_or_default(),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            json_logs: match var("FARM_LOG_FORMAT").as_deref() {
                None | Some("text") => false,
                Some("json") => true,
                Some(other) => {
                    return Err(Error::Config(format!(
                        "FARM_LOG_FORMAT must be text or json, got {other}"
                    )));
                }
            },
        })
    }

    /// Project hosting the Pub/Sub topic. Falls back to our own project.
    pub fn topic_project(&self, own_project_id: &str) -> String {
        match &self.topic_project_id {
            Some(project) => project.clone(),
            None => {
                error!("FARM_TOPIC_PROJECT_ID not set, publishing to own project");
                own_project_id.to_string()
            }
        }
    }
}

impl ArgoConfig {
    /// The configured token, or the in-cluster service-account token.
    pub fn resolve_token(&self) -> Result<Option<SecretString>> {
        if let Some(token) = &self.token {
            return Ok(Some(SecretString::from(token.expose_secret().to_string())));
        }
        read_token_file(Path::new(IN_CLUSTER_TOKEN))
    }
}

/// Read a bearer token from a file; a missing file is not an error.
pub fn read_token_file(path: &Path) -> Result<Option<SecretString>> {
    match std::fs::read_to_string(path) {
        Ok(token) => Ok(Some(SecretString::from(token.trim().to_string()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn flag(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<bool> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("0" | "false" | "no" | "off") => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some(other) => Err(Error::Config(format!("{name} must be a boolean, got {other}"))),
    }
}

fn seconds(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration> {
    match var(name) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| Error::Config(format!("{name} must be a number of seconds: {e}"))),
    }
}

fn exclusion(name: &str, pattern: Option<String>) -> Result<ExclusionFilter> {
    match pattern {
        None => Ok(ExclusionFilter::none()),
        Some(p) => Regex::new(&p)
            .map(ExclusionFilter::new)
            .map_err(|e| Error::Config(format!("{name} is not a valid regex: {e}"))),
    }
}
