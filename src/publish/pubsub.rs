//! Google Cloud Pub/Sub publisher over the REST API.

use super::{Publisher, Topic};
use crate::error::{Error, Result};
use crate::gcp::auth::TokenSource;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [PubsubMessage<'a>; 1],
}

#[derive(Serialize)]
struct PubsubMessage<'a> {
    data: String,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Publishes to `{endpoint}/v1/projects/{project}/topics/{topic}:publish`.
///
/// Without a token source requests go unauthenticated, which is what the
/// Pub/Sub emulator expects.
pub struct PubSubPublisher {
    http: reqwest::Client,
    endpoint: String,
    tokens: Option<Arc<TokenSource>>,
}

impl PubSubPublisher {
    pub fn new(endpoint: &str, tokens: Option<Arc<TokenSource>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tokens,
        })
    }
}

#[async_trait]
impl Publisher for PubSubPublisher {
    async fn publish(
        &self,
        topic: &Topic,
        payload: Vec<u8>,
        attributes: &BTreeMap<String, String>,
    ) -> Result<String> {
        let url = format!("{}/v1/{topic}:publish", self.endpoint);
        let body = PublishRequest {
            messages: [PubsubMessage {
                data: STANDARD.encode(payload),
                attributes,
            }],
        };

        let mut request = self.http.post(url).json(&body);
        if let Some(tokens) = &self.tokens {
            let token = tokens.token().await?;
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Publish(format!("{topic}: {status}: {text}")));
        }

        let parsed: PublishResponse = resp.json().await?;
        parsed
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::Publish(format!("{topic}: response carried no message id")))
    }
}
