//! Signaling integration tests. A local axum server stands in for the
//! token backend and the realtime SDP endpoint.
//!
//! Run with: `cargo test -p lisan-signaling --test integration`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use lisan_core::error::LisanError;
use lisan_signaling::{
    Credential, CredentialFetcher, HttpCredentialFetcher, HttpSignalingNegotiator,
    SignalingNegotiator,
};

const ANSWER_SDP: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

/// What the stand-in realtime endpoint saw.
#[derive(Debug, Clone, Default)]
struct SeenOffer {
    authorization: Option<String>,
    content_type: Option<String>,
    model: Option<String>,
    body: String,
}

type Seen = Arc<Mutex<Vec<SeenOffer>>>;

/// Serve `router` on an ephemeral port and return its base URL.
async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

async fn realtime_endpoint(
    State(seen): State<Seen>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    seen.lock().unwrap().push(SeenOffer {
        authorization: header("authorization"),
        content_type: header("content-type"),
        model: query.get("model").cloned(),
        body,
    });
    (StatusCode::CREATED, ANSWER_SDP.to_string())
}

async fn start_stand_in() -> (String, Seen) {
    let seen: Seen = Arc::default();
    let router = Router::new()
        .route(
            "/token",
            get(|| async { Json(json!({ "client_secret": { "value": "abc123" } })) }),
        )
        .route(
            "/token-broken",
            get(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Failed to generate token" })),
                )
            }),
        )
        .route(
            "/token-empty",
            get(|| async { Json(json!({ "id": "sess_1" })) }),
        )
        .route("/v1/realtime", post(realtime_endpoint))
        .route(
            "/v1/realtime-denied",
            post(|| async { (StatusCode::UNAUTHORIZED, "invalid ephemeral key") }),
        )
        .route(
            "/v1/realtime-garbage",
            post(|| async { (StatusCode::OK, "<html>gateway</html>") }),
        )
        .with_state(seen.clone());
    (serve(router).await, seen)
}

#[tokio::test]
async fn test_credential_then_negotiation_uses_bearer() {
    let (base, seen) = start_stand_in().await;

    let fetcher = HttpCredentialFetcher::new(format!("{base}/token"));
    let credential = fetcher.fetch().await.expect("credential fetch failed");
    assert_eq!(credential.secret(), "abc123");

    let negotiator =
        HttpSignalingNegotiator::new(format!("{base}/v1/realtime"), "gpt-4o-realtime-preview-2024-12-17");
    let offer = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
    let answer = negotiator
        .negotiate(credential, offer)
        .await
        .expect("negotiation failed");
    assert_eq!(answer, ANSWER_SDP);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "exactly one signaling round trip");
    let offer_seen = &seen[0];
    assert_eq!(offer_seen.authorization.as_deref(), Some("Bearer abc123"));
    assert_eq!(offer_seen.content_type.as_deref(), Some("application/sdp"));
    assert_eq!(
        offer_seen.model.as_deref(),
        Some("gpt-4o-realtime-preview-2024-12-17")
    );
    assert_eq!(offer_seen.body, offer);
}

#[tokio::test]
async fn test_negotiation_encodes_model_query() {
    let (base, seen) = start_stand_in().await;
    let model = "tutor model&voice=alloy#1";
    let negotiator = HttpSignalingNegotiator::new(format!("{base}/v1/realtime"), model);
    negotiator
        .negotiate(Credential::new("abc123"), "v=0\r\n")
        .await
        .expect("negotiation failed");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].model.as_deref(), Some(model));
}

#[tokio::test]
async fn test_credential_backend_error_status() {
    let (base, _) = start_stand_in().await;
    let err = HttpCredentialFetcher::new(format!("{base}/token-broken"))
        .fetch()
        .await
        .unwrap_err();
    match err {
        LisanError::Credential(msg) => assert!(msg.contains("500"), "got: {msg}"),
        other => panic!("expected credential error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_credential_missing_secret() {
    let (base, _) = start_stand_in().await;
    let err = HttpCredentialFetcher::new(format!("{base}/token-empty"))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, LisanError::Credential(_)), "got {err:?}");
}

#[tokio::test]
async fn test_credential_backend_unreachable() {
    // Grab a free port, then release it so nothing is listening.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let err = HttpCredentialFetcher::new(format!("http://127.0.0.1:{port}/token"))
        .fetch()
        .await
        .unwrap_err();
    assert!(matches!(err, LisanError::Credential(_)), "got {err:?}");
}

#[tokio::test]
async fn test_negotiation_rejected_status() {
    let (base, _) = start_stand_in().await;
    let err = HttpSignalingNegotiator::new(format!("{base}/v1/realtime-denied"), "m")
        .negotiate(Credential::new("expired"), "v=0\r\n")
        .await
        .unwrap_err();
    match err {
        LisanError::Negotiation(msg) => assert!(msg.contains("401"), "got: {msg}"),
        other => panic!("expected negotiation error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_negotiation_unparsable_answer() {
    let (base, _) = start_stand_in().await;
    let err = HttpSignalingNegotiator::new(format!("{base}/v1/realtime-garbage"), "m")
        .negotiate(Credential::new("abc123"), "v=0\r\n")
        .await
        .unwrap_err();
    assert!(matches!(err, LisanError::Negotiation(_)), "got {err:?}");
}
