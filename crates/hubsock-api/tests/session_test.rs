#![allow(clippy::unwrap_used)]

// Integration tests for `SessionProbe` using wiremock.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hubsock_api::{Error, HttpConfig, SessionProbe};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, SessionProbe) {
    let server = MockServer::start().await;
    let url = format!("{}/session", server.uri()).parse().unwrap();
    let probe = SessionProbe::new(url, &HttpConfig::default()).unwrap();
    (server, probe)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_current_session_returns_document() {
    let (server, probe) = setup().await;

    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "expireInSec": 3600,
            "user": "admin"
        })))
        .mount(&server)
        .await;

    let session = probe.current_session(Duration::from_secs(5)).await.unwrap();
    assert_eq!(session["user"], "admin");
    assert_eq!(session["expireInSec"], 3600);
}

#[tokio::test]
async fn test_current_session_times_out() {
    let (server, probe) = setup().await;

    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = probe
        .current_session(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { timeout_ms: 100 }), "got {err:?}");
}

#[tokio::test]
async fn test_current_session_rejects_non_json() {
    let (server, probe) = setup().await;

    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;

    let err = probe.current_session(Duration::from_secs(5)).await.unwrap_err();
    match err {
        Error::Deserialization { body, .. } => assert!(body.contains("login")),
        other => panic!("expected deserialization error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_current_session_http_error() {
    let (server, probe) = setup().await;

    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = probe.current_session(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, Error::Http(_)), "got {err:?}");
}
