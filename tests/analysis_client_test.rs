//! Analysis client tests
//!
//! Runs the HTTP analysis client against a mock service and checks how each
//! kind of reply is classified.

use std::path::PathBuf;
use std::time::Duration;

use assert_matches::assert_matches;
use mediaflow::analysis_client::HttpAnalysisService;
use mf_core::Error;
use mf_pipeline::AnalysisService;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn artifact(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("clip-640x360.mp4");
    std::fs::write(&path, b"abc").unwrap();
    path
}

fn client(server: &MockServer) -> HttpAnalysisService {
    HttpAnalysisService::new(
        format!("{}/v1/analyze", server.uri()),
        Some("secret".into()),
        "media-analysis-v1",
        Duration::from_secs(5),
    )
    .unwrap()
}

fn valid_report() -> serde_json::Value {
    json!({
        "summary": "Two people talk on a beach.",
        "scenes": [
            { "start_secs": 0.0, "end_secs": 3.5, "description": "wide shot" },
            { "start_secs": 3.5, "end_secs": 9.0, "description": "close-up" }
        ],
        "audio": { "speech": true, "music": false, "transcript": "hello" },
        "entities": ["person", "beach"]
    })
}

/// A well-formed reply becomes a validated report; the request carries the
/// model, the base64 payload and the bearer token.
#[tokio::test]
async fn test_valid_response_is_parsed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/analyze"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "model": "media-analysis-v1",
            "media": { "mime_type": "video/mp4", "data": "YWJj" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(valid_report()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let report = client(&server).analyze(&artifact(&dir)).await.unwrap();

    assert_eq!(report.summary, "Two people talk on a beach.");
    assert_eq!(report.scenes.len(), 2);
    assert!(report.audio.speech);
    assert_eq!(report.entities, vec!["person", "beach"]);
}

#[tokio::test]
async fn test_rate_limit_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server).analyze(&artifact(&dir)).await.unwrap_err();

    assert!(err.is_transient());
    assert!(err.to_string().contains("429"), "{err}");
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server).analyze(&artifact(&dir)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_bad_request_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unsupported codec"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server).analyze(&artifact(&dir)).await.unwrap_err();

    assert_matches!(err, Error::Analysis { transient: false, ref message } if message.contains("unsupported codec"));
}

#[tokio::test]
async fn test_undecodable_body_is_permanent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server).analyze(&artifact(&dir)).await.unwrap_err();
    assert_matches!(err, Error::Analysis { transient: false, .. });
}

/// A reply that parses as JSON but breaks the schema is not retried.
#[tokio::test]
async fn test_schema_violation_is_permanent() {
    let server = MockServer::start().await;
    let mut report = valid_report();
    report["scenes"][1]["end_secs"] = json!(1.0);
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(report))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let err = client(&server).analyze(&artifact(&dir)).await.unwrap_err();

    assert!(!err.is_transient());
    assert!(err.to_string().contains("scene 1"), "{err}");
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    // Nothing listens on a port that was just released.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let client = HttpAnalysisService::new(
        format!("http://127.0.0.1:{port}/v1/analyze"),
        None,
        "media-analysis-v1",
        Duration::from_secs(2),
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let err = client.analyze(&artifact(&dir)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_missing_artifact_is_io_error() {
    let server = MockServer::start().await;
    let err = client(&server)
        .analyze(std::path::Path::new("/nonexistent/clip.mp4"))
        .await
        .unwrap_err();
    assert_matches!(err, Error::Io { .. });
}
