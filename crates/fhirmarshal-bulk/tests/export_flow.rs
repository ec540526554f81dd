//! Bulk export against a mock FHIR server.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fhirmarshal_bulk::{BulkError, BulkExportClient, BulkExportConfig, ExportState};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const UNIT: Duration = Duration::from_millis(1);

fn config(dir: &std::path::Path) -> BulkExportConfig {
    let mut config = BulkExportConfig::default()
        .with_output_dir(dir)
        .with_time_unit(UNIT)
        .with_num_dl(2);
    config.download_retries = 2;
    config
}

fn envelope(lines: &[&str]) -> serde_json::Value {
    let data: Vec<String> = lines.iter().map(|l| STANDARD.encode(l)).collect();
    json!({ "data": data.join("\n") })
}

#[tokio::test]
async fn test_poll_waits_grow_with_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(202).insert_header("Retry-After", "10"))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(config(dir.path())).unwrap();
    let poll_url = format!("{}/fhir/$export-poll-status", server.uri());

    let (manifest, report) = client
        .poll(&poll_url, &CancellationToken::new())
        .await
        .expect("poll failed");

    assert!(manifest.output.is_empty());
    assert_eq!(report.attempts, 4);
    assert_eq!(report.waits, vec![UNIT * 10, UNIT * 20, UNIT * 30]);
}

#[tokio::test]
async fn test_poll_gives_up_after_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path()).with_max_retries(3);
    cfg.default_retry_after_secs = 1;
    let client = BulkExportClient::new(cfg).unwrap();

    let err = client
        .poll(&format!("{}/poll/1", server.uri()), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::PollExhausted { attempts: 3 }));
}

#[tokio::test]
async fn test_poll_backs_off_on_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/poll/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.error_backoff_secs = 3;
    let client = BulkExportClient::new(cfg).unwrap();

    let (_, report) = client
        .poll(&format!("{}/poll/1", server.uri()), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.waits, vec![UNIT * 3, UNIT * 6]);
}

#[tokio::test]
async fn test_full_export_flow() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/fhir/$export"))
        .and(header("Prefer", "respond-async"))
        .and(header("Accept", "application/fhir+json"))
        .and(header("Authorization", "Bearer t0k"))
        .respond_with(
            ResponseTemplate::new(202).insert_header("Content-Location", "/status/42"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/42"))
        .respond_with(ResponseTemplate::new(202).insert_header("Retry-After", "5"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "transactionTime": "2024-05-01T00:00:00Z",
            "request": format!("{base}/fhir/$export"),
            "output": [
                {"type": "Patient", "url": format!("{base}/files/patient-1")},
                {"type": "Observation", "url": format!("{base}/files/obs-1")},
                {"type": "Encounter", "url": format!("{base}/files/gone")}
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/patient-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&[
            r#"{"resourceType":"Patient","id":"p1"}"#,
            r#"{"resourceType":"Patient","id":"p2"}"#,
        ])))
        .mount(&server)
        .await;
    let obs = STANDARD.encode(r#"{"resourceType":"Observation","id":"o1"}"#);
    Mock::given(method("GET"))
        .and(path("/files/obs-1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": format!("{obs}\n%%garbage%%\n") })),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(config(dir.path()))
        .unwrap()
        .with_token("t0k");
    let states = client.subscribe();

    let outcome = client
        .run(&format!("{base}/fhir/$export"), CancellationToken::new())
        .await
        .expect("export failed");

    assert_eq!(outcome.poll_url, format!("{base}/status/42"));
    assert_eq!(outcome.poll.waits, vec![UNIT * 5]);
    assert_eq!(outcome.listings.len(), 3);
    assert_eq!(outcome.staged.len(), 2);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].listing.resource_type, "Encounter");
    assert_eq!(outcome.lines_written, 3);
    assert_eq!(outcome.lines_rejected, 1);

    assert!(dir.path().join("staging/0000-Patient-patient-1.ndjson").exists());
    // staged files are merged in manifest order
    let merged = std::fs::read_to_string(dir.path().join("output.ndjson")).unwrap();
    let ids: Vec<String> = merged
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].to_string())
        .collect();
    assert_eq!(ids, ["\"p1\"", "\"p2\"", "\"o1\""]);

    assert_eq!(*states.borrow(), ExportState::Done);
}

#[tokio::test]
async fn test_poll_status_url_skips_submission() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": []})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(config(dir.path())).unwrap();
    let outcome = client
        .run(
            &format!("{}/fhir/$export-poll-status?_jobId=7", server.uri()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.lines_written, 0);
    assert!(dir.path().join("output.ndjson").exists());
}

#[tokio::test]
async fn test_listings_differing_only_by_query_are_all_merged() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": [
                {"type": "Patient", "url": format!("{base}/files?part=1")},
                {"type": "Patient", "url": format!("{base}/files?part=2")}
            ]
        })))
        .mount(&server)
        .await;
    for (part, id) in [("1", "p1"), ("2", "p2")] {
        let line = format!(r#"{{"resourceType":"Patient","id":"{id}"}}"#);
        Mock::given(method("GET"))
            .and(path("/files"))
            .and(query_param("part", part))
            .respond_with(ResponseTemplate::new(200).set_body_json(envelope(&[&line])))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(config(dir.path())).unwrap();
    let outcome = client
        .run(&format!("{base}/fhir/$export-poll-status"), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.staged.len(), 2);
    assert_ne!(outcome.staged[0], outcome.staged[1]);
    assert_eq!(outcome.lines_written, 2);
    let merged = std::fs::read_to_string(dir.path().join("output.ndjson")).unwrap();
    assert!(merged.contains(r#""id":"p1""#));
    assert!(merged.contains(r#""id":"p2""#));
}

#[tokio::test]
async fn test_downloads_outlive_the_api_request_deadline() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": [{"type": "Patient", "url": format!("{base}/files/slow")}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(envelope(&[r#"{"resourceType":"Patient","id":"p1"}"#]))
                .set_delay(Duration::from_millis(1500)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.request_timeout_secs = 1;
    cfg.read_timeout_secs = 10;
    let client = BulkExportClient::new(cfg).unwrap();
    let outcome = client
        .run(&format!("{base}/fhir/$export-poll-status"), CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.failed.is_empty());
    assert_eq!(outcome.lines_written, 1);
}

#[tokio::test]
async fn test_submit_requires_content_location() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(config(dir.path())).unwrap();
    let err = client
        .run(&format!("{}/fhir/$export", server.uri()), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BulkError::MissingContentLocation));
    assert_eq!(client.state(), ExportState::Failed);
}

#[tokio::test]
async fn test_cancelled_export_stops_polling() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fhir/$export-poll-status"))
        .respond_with(ResponseTemplate::new(202).insert_header("Retry-After", "100000"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let client = BulkExportClient::new(
        config(dir.path()).with_time_unit(Duration::from_secs(1)),
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = client
        .run(&format!("{}/fhir/$export-poll-status", server.uri()), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::Cancelled));
    assert_eq!(client.state(), ExportState::Failed);
}
