//! Cached OAuth access tokens from the metadata server.

use super::MetadataClient;
use crate::error::Result;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Refresh this long before the server-reported expiry.
const EXPIRY_SLACK: Duration = Duration::from_secs(60);

struct Cached {
    token: SecretString,
    refresh_at: Instant,
}

/// Hands out bearer tokens, fetching a new one only when the cached token
/// is close to expiry.
pub struct TokenSource {
    metadata: MetadataClient,
    cached: Mutex<Option<Cached>>,
}

impl TokenSource {
    pub fn new(metadata: MetadataClient) -> Self {
        Self {
            metadata,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref().filter(|c| Instant::now() < c.refresh_at) {
            return Ok(SecretString::from(c.token.expose_secret().to_owned()));
        }

        let fresh = self.metadata.access_token().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_SLACK);
        let token = SecretString::from(fresh.access_token);
        let handed_out = SecretString::from(token.expose_secret().to_owned());
        *cached = Some(Cached {
            token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(handed_out)
    }
}
