//! Remote-service clients used before the peer connection exists.
//!
//! [`CredentialFetcher`] mints the short-lived secret for one session and
//! [`SignalingNegotiator`] trades the local SDP offer for the remote answer.
//! Both are traits so the session state machine can run against fakes.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use lisan_core::error::Result;

pub mod credential;
pub mod negotiate;

pub use credential::HttpCredentialFetcher;
pub use negotiate::HttpSignalingNegotiator;

/// A short-lived access credential. Never cached, never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// The bearer secret.
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Expiry reported by the backend, when it sends one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Obtains a fresh credential from a trusted backend.
#[async_trait]
pub trait CredentialFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Credential>;
}

/// One-shot offer/answer exchange with the remote endpoint.
#[async_trait]
pub trait SignalingNegotiator: Send + Sync {
    /// Send the local offer SDP, return the remote answer SDP.
    ///
    /// The credential is consumed: it is good for exactly one negotiation.
    async fn negotiate(&self, credential: Credential, offer_sdp: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential::new("ek_live_secret");
        let shown = format!("{credential:?}");
        assert!(!shown.contains("ek_live_secret"));
        assert!(shown.contains("redacted"));
        assert_eq!(credential.secret(), "ek_live_secret");
    }
}
