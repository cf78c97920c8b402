//! HTTP driver against a stub resource manager.

use std::time::Duration;

use drover_scheduler::config::ClusterConfig;
use drover_scheduler::driver::{ClusterDriver, DriverError, FrameworkInfo, HttpDriver, SchedulerEvent};
use futures_util::StreamExt;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn record(event: serde_json::Value) -> Vec<u8> {
    let body = event.to_string();
    format!("{}\n{}", body.len(), body).into_bytes()
}

fn framework() -> FrameworkInfo {
    FrameworkInfo::from_config(&ClusterConfig::default(), None)
}

#[tokio::test]
async fn test_subscribe_streams_events_and_calls_reuse_stream_id() {
    let server = MockServer::start().await;

    let mut body = record(json!({
        "type": "SUBSCRIBED",
        "subscribed": {
            "framework_id": { "value": "fw-1" },
            "heartbeat_interval_seconds": 15.0
        }
    }));
    body.extend(record(json!({ "type": "HEARTBEAT" })));

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(body_partial_json(json!({ "type": "SUBSCRIBE" })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Mesos-Stream-Id", "stream-7")
                .set_body_bytes(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .and(header("Mesos-Stream-Id", "stream-7"))
        .and(body_partial_json(json!({
            "type": "DECLINE",
            "framework_id": { "value": "fw-1" },
            "decline": { "offer_ids": [{ "value": "o-1" }] }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let driver = HttpDriver::new(vec![server.uri()]).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();

    let first = events.next().await.unwrap().unwrap();
    assert_eq!(
        first,
        SchedulerEvent::Subscribed {
            framework_id: "fw-1".to_string(),
            heartbeat_interval: Some(Duration::from_secs(15)),
        }
    );
    assert_eq!(events.next().await.unwrap().unwrap(), SchedulerEvent::Heartbeat);
    assert!(matches!(events.next().await, Some(Err(DriverError::StreamClosed))));
    assert!(events.next().await.is_none());

    assert_eq!(driver.framework_id().as_deref(), Some("fw-1"));
    driver
        .decline(&["o-1".to_string()], Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_subscribe_falls_through_refusing_masters() {
    let refusing = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("not the leader"))
        .expect(1)
        .mount(&refusing)
        .await;

    let leader = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/scheduler"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(record(json!({
            "type": "SUBSCRIBED",
            "subscribed": { "framework_id": { "value": "fw-2" } }
        }))))
        .expect(1)
        .mount(&leader)
        .await;

    let driver = HttpDriver::new(vec![refusing.uri(), leader.uri()]).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();
    let first = events.next().await.unwrap().unwrap();
    assert!(matches!(first, SchedulerEvent::Subscribed { ref framework_id, heartbeat_interval: None } if framework_id == "fw-2"));
}

#[tokio::test]
async fn test_subscribe_reports_last_refusal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad framework"))
        .mount(&server)
        .await;

    let driver = HttpDriver::new(vec![server.uri()]).unwrap();
    let err = match driver.subscribe(&framework()).await {
        Ok(_) => panic!("subscription should be refused"),
        Err(e) => e,
    };
    match err {
        DriverError::Status { code, body } => {
            assert_eq!(code, 400);
            assert_eq!(body, "bad framework");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_rejected_call_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "type": "SUBSCRIBE" })))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(record(json!({
            "type": "SUBSCRIBED",
            "subscribed": { "framework_id": { "value": "fw-3" } }
        }))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "type": "SHUTDOWN" })))
        .respond_with(ResponseTemplate::new(409).set_body_string("unknown executor"))
        .mount(&server)
        .await;

    let driver = HttpDriver::new(vec![server.uri()]).unwrap();
    let mut events = driver.subscribe(&framework()).await.unwrap();
    events.next().await.unwrap().unwrap();

    let err = driver.shutdown("agent-1", "exec-1").await.unwrap_err();
    assert!(matches!(err, DriverError::Status { code: 409, .. }));
}
