//! Ephemeral credential fetch from the token backend (`GET /token`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use lisan_core::error::{LisanError, Result};

use crate::{Credential, CredentialFetcher};

/// Fetches `{ "client_secret": { "value": "..." } }` from an HTTP backend.
pub struct HttpCredentialFetcher {
    url: String,
    client: reqwest::Client,
}

impl HttpCredentialFetcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

// --- token backend response ---

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    client_secret: Option<ClientSecret>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    #[serde(default)]
    value: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Extract the credential from a token backend body.
fn parse_token_body(body: &str) -> Result<Credential> {
    let parsed: TokenResponse = serde_json::from_str(body)
        .map_err(|e| LisanError::Credential(format!("malformed token response: {e}")))?;

    let secret = parsed
        .client_secret
        .ok_or_else(|| LisanError::Credential("token response has no client_secret".into()))?;

    let value = secret
        .value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LisanError::Credential("token response has no client_secret.value".into()))?;

    let mut credential = Credential::new(value);
    if let Some(expires_at) = secret.expires_at.and_then(|s| DateTime::<Utc>::from_timestamp(s, 0)) {
        credential = credential.with_expiry(expires_at);
    }
    Ok(credential)
}

#[async_trait]
impl CredentialFetcher for HttpCredentialFetcher {
    async fn fetch(&self) -> Result<Credential> {
        debug!(url = %self.url, "Fetching ephemeral credential");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| LisanError::Credential(format!("token backend unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LisanError::Credential(format!(
                "token backend error {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LisanError::Credential(format!("token body read failed: {e}")))?;

        let credential = parse_token_body(&body)?;
        debug!(expires_at = ?credential.expires_at(), "Credential acquired");
        Ok(credential)
    }
}
