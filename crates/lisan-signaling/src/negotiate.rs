//! SDP offer/answer exchange with the realtime endpoint.
//!
//! One `POST <base>?model=<id>` with the offer as `application/sdp`; the
//! response body is the answer. No retry, no renegotiation.

use async_trait::async_trait;
use tracing::debug;

use lisan_core::error::{LisanError, Result};

use crate::{Credential, SignalingNegotiator};

pub struct HttpSignalingNegotiator {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl HttpSignalingNegotiator {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_client(base_url, model, reqwest::Client::new())
    }

    pub fn with_client(
        base_url: impl Into<String>,
        model: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Minimal sanity check on the answer before handing it to the peer connection.
fn validate_answer(body: String) -> Result<String> {
    if body.trim_start().starts_with("v=") {
        Ok(body)
    } else if body.trim().is_empty() {
        Err(LisanError::Negotiation("empty answer body".into()))
    } else {
        let preview: String = body.chars().take(80).collect();
        Err(LisanError::Negotiation(format!(
            "answer is not a session description: {preview}"
        )))
    }
}

#[async_trait]
impl SignalingNegotiator for HttpSignalingNegotiator {
    async fn negotiate(&self, credential: Credential, offer_sdp: &str) -> Result<String> {
        debug!(
            base_url = %self.base_url,
            model = %self.model,
            offer_bytes = offer_sdp.len(),
            "Posting SDP offer"
        );

        let response = self
            .client
            .post(&self.base_url)
            .query(&[("model", self.model.as_str())])
            .header("authorization", format!("Bearer {}", credential.secret()))
            .header("content-type", "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| LisanError::Negotiation(format!("signaling request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LisanError::Negotiation(format!(
                "realtime endpoint error {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LisanError::Negotiation(format!("answer body read failed: {e}")))?;

        let answer = validate_answer(body)?;
        debug!(answer_bytes = answer.len(), "Received SDP answer");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let negotiator = HttpSignalingNegotiator::new("https://api.openai.com/v1/realtime/", "m");
        assert_eq!(negotiator.base_url, "https://api.openai.com/v1/realtime");
        assert_eq!(negotiator.model(), "m");
    }

    #[test]
    fn test_validate_answer() {
        assert!(validate_answer("v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n".into()).is_ok());
        assert!(matches!(
            validate_answer("   ".into()),
            Err(LisanError::Negotiation(_))
        ));
        assert!(matches!(
            validate_answer(r#"{"error":{"message":"bad"}}"#.into()),
            Err(LisanError::Negotiation(_))
        ));
    }
}
