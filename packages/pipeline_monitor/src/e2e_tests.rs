//! End-to-end tests: the monitor facade driven over in-memory links, and the
//! websocket dialer and HTTP client against real local servers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::{Notify, watch};
use tokio::time::timeout;

use crate::client::{PipelineClient, PipelineTestRequest};
use crate::config::{ApiConfig, EndpointFileConfig, MonitorConfig};
use crate::error::{ChannelError, ClientError, MonitorError, RegistryError};
use crate::merger::StepSource;
use crate::model::{BatchResult, ConnectionState, SessionStatus, StepStatus};
use crate::monitor::{MonitorSnapshot, PipelineMonitor};
use crate::protocol::ClientMessage;
use crate::registry::JoinOutcome;
use crate::test_helpers::{Outcome, ScriptedDialer, test_credential};
use crate::transport::{ChannelTransport, Dialer, TransportEvent, TransportSettings, WsDialer};

/// Timeout for each async wait in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn quiet_config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.transport.heartbeat_interval = None;
    config
}

async fn wait_until(
    view: &mut watch::Receiver<MonitorSnapshot>,
    ready: impl FnMut(&MonitorSnapshot) -> bool,
) -> MonitorSnapshot {
    timeout(TEST_TIMEOUT, view.wait_for(ready))
        .await
        .expect("view did not reach expected state")
        .unwrap()
        .clone()
}

async fn wait_received(view: &mut watch::Receiver<MonitorSnapshot>, n: u64) -> MonitorSnapshot {
    wait_until(view, |s| s.stats.received >= n).await
}

fn join(test_id: &str) -> ClientMessage {
    ClientMessage::JoinSession {
        test_id: test_id.into(),
    }
}

fn joined(test_id: &str) -> Value {
    json!({"type": "SessionJoined", "testId": test_id})
}

fn test_started(test_id: &str, steps: &[&str]) -> Value {
    json!({
        "type": "TestStarted",
        "testId": test_id,
        "sessionId": format!("session-{test_id}"),
        "query": "revenue by region",
        "steps": steps,
        "startTime": "2026-10-19T10:00:00Z"
    })
}

fn step_started(test_id: &str, step: &str) -> Value {
    json!({
        "type": "StepStarted",
        "testId": test_id,
        "stepName": step,
        "startTime": "2026-10-19T10:00:01Z"
    })
}

fn step_progress(test_id: &str, step: &str, percent: u32) -> Value {
    json!({"type": "StepProgress", "testId": test_id, "stepName": step, "progressPercent": percent})
}

fn step_completed(test_id: &str, step: &str, details: Value) -> Value {
    json!({
        "type": "StepCompleted",
        "testId": test_id,
        "stepName": step,
        "endTime": "2026-10-19T10:00:03Z",
        "details": details
    })
}

// =============================================================================
// Reconnect schedule
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reconnect_follows_backoff_schedule() {
    let (dialer, mut servers) = ScriptedDialer::new();
    dialer.script([Outcome::Accept]);
    dialer.script((0..5).map(|_| Outcome::Reject(ChannelError::Transport("refused".into()))));
    let (transport, mut events) = ChannelTransport::new(
        dialer.clone(),
        "ws://pipeline.test/hubs/pipeline",
        test_credential(),
        TransportSettings::default(),
    );

    transport.connect().await.unwrap();
    drop(servers.recv().await.unwrap());

    assert!(matches!(
        events.recv().await.unwrap(),
        TransportEvent::ConnectionLost { .. }
    ));
    assert_eq!(
        events.recv().await.unwrap(),
        TransportEvent::Reconnected { attempts: 6 }
    );
    assert_eq!(transport.state(), ConnectionState::Connected);

    let times = dialer.attempt_times();
    assert_eq!(times.len(), 7);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [0, 2_000, 10_000, 30_000, 30_000, 30_000].map(Duration::from_millis);
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(
            *gap >= want && *gap < want + Duration::from_millis(20),
            "gap {gap:?} should be about {want:?} (all gaps: {gaps:?})"
        );
    }
}

// =============================================================================
// Facade over an in-memory link
// =============================================================================

#[tokio::test]
async fn join_is_sent_once() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    monitor.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();

    assert_eq!(monitor.join_session("t1").await.unwrap(), JoinOutcome::Sent);
    assert_eq!(
        monitor.join_session("t1").await.unwrap(),
        JoinOutcome::AlreadyJoined
    );
    monitor.leave_session("t1").await.unwrap();

    assert_eq!(server.next_control().await, Some(join("t1")));
    assert_eq!(
        server.next_control().await,
        Some(ClientMessage::LeaveSession {
            test_id: "t1".into()
        })
    );
}

#[tokio::test]
async fn join_before_connect_is_skipped() {
    let (dialer, _servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());

    let err = monitor.join_session("t1").await.unwrap_err();
    assert!(matches!(
        err,
        MonitorError::Registry(RegistryError::JoinSkipped {
            state: ConnectionState::Disconnected,
            ..
        })
    ));
}

#[tokio::test]
async fn full_scenario_merges_telemetry_with_batch() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    let mut view = monitor.subscribe();

    monitor.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();
    monitor.begin_job("t1").await.unwrap();
    monitor.join_session("t1").await.unwrap();
    assert_eq!(server.next_control().await, Some(join("t1")));

    server.push(joined("t1"));
    let snap = wait_received(&mut view, 1).await;
    assert_eq!(snap.session.unwrap().status, SessionStatus::Waiting);

    server.push(test_started("t1", &["A", "B"]));
    server.push(step_started("t1", "A"));
    server.push(step_progress("t1", "A", 40));
    server.push(step_progress("t1", "A", 25));
    let snap = wait_received(&mut view, 5).await;
    assert_eq!(snap.steps["A"].progress_percent, 40);
    assert_eq!(snap.steps["A"].status, StepStatus::Running);
    assert_eq!(snap.steps["B"].status, StepStatus::Pending);

    server.push(step_completed("t1", "A", json!({"x": 1})));
    server.push(step_progress("t1", "A", 10));
    let snap = wait_received(&mut view, 7).await;
    assert_eq!(snap.steps["A"].status, StepStatus::Completed);
    assert_eq!(snap.steps["A"].progress_percent, 100);
    assert_eq!(snap.stats.ignored, 2);
    assert_eq!(snap.stats.malformed, 0);
    assert_eq!(snap.overall_percent(), 50);

    let batch = BatchResult::from_value(json!({
        "success": true,
        "totalDurationMs": 3100,
        "results": {"B": {"success": true, "durationMs": 800, "sql": "select 1"}}
    }))
    .unwrap();
    let result = monitor
        .await_reconciled_result(async { Ok::<_, ClientError>(batch) })
        .await
        .unwrap();

    assert_eq!(result.test_id.as_deref(), Some("t1"));
    assert!(result.telemetry_complete);
    let a = result.step("A").unwrap();
    assert_eq!(a.source, StepSource::Telemetry);
    assert_eq!(a.result.duration_ms, Some(2000));
    assert_eq!(a.result.data.get("x"), Some(&json!(1)));
    let b = result.step("B").unwrap();
    assert_eq!(b.source, StepSource::Batch);
    assert_eq!(b.result.duration_ms, Some(800));
}

#[tokio::test]
async fn merge_runs_once_per_test() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    let mut view = monitor.subscribe();
    monitor.connect().await.unwrap();
    let server = servers.recv().await.unwrap();
    monitor.begin_job("t1").await.unwrap();

    server.push(test_started("t1", &["A"]));
    server.push(step_started("t1", "A"));
    server.push(step_completed("t1", "A", json!({})));
    wait_received(&mut view, 3).await;

    let first = monitor
        .await_reconciled_result(async {
            Ok::<_, ClientError>(BatchResult::from_value(json!({"success": true})).unwrap())
        })
        .await
        .unwrap();
    let second = monitor
        .await_reconciled_result(async {
            Ok::<_, ClientError>(BatchResult::from_value(json!({"success": false})).unwrap())
        })
        .await
        .unwrap();
    assert_eq!(first, second);
    assert!(second.success);

    monitor.begin_job("t2").await.unwrap();
    assert!(monitor.current_session().is_none());
}

#[tokio::test]
async fn batch_failure_propagates() {
    let (dialer, _servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());

    let err = monitor
        .await_reconciled_result(async {
            Err::<BatchResult, _>(ClientError::Status {
                status: 500,
                message: "pipeline crashed".into(),
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "status");
}

#[tokio::test]
async fn malformed_and_foreign_events_are_dropped() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    let mut view = monitor.subscribe();
    monitor.connect().await.unwrap();
    let server = servers.recv().await.unwrap();
    monitor.begin_job("t1").await.unwrap();

    server.push(test_started("t1", &["A"]));
    server.push_raw("{not json");
    server.push(json!({"type": "Telemetry", "testId": "t1"}));
    server.push(step_started("t1", "Z"));
    server.push(step_started("t2", "A"));
    server.push(json!({"type": "stepStarted", "TestId": "t1", "StepName": "A"}));

    let snap = wait_received(&mut view, 6).await;
    assert_eq!(snap.stats.malformed, 3);
    assert_eq!(snap.stats.ignored, 1);
    assert_eq!(snap.stats.applied, 2);
    assert_eq!(snap.steps.len(), 1);
    assert_eq!(snap.steps["A"].status, StepStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn rejoins_after_reconnect() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer.clone(), &quiet_config(), test_credential());
    monitor.connect().await.unwrap();
    let mut first = servers.recv().await.unwrap();
    monitor.join_session("t1").await.unwrap();
    assert_eq!(first.next_control().await, Some(join("t1")));

    first.fail("connection reset");
    let mut second = servers.recv().await.unwrap();
    assert_eq!(second.next_control().await, Some(join("t1")));
    assert_eq!(monitor.connection_state(), ConnectionState::Connected);
    assert_eq!(dialer.attempts(), 2);
    assert_eq!(
        dialer.credentials_seen(),
        vec!["test-token".to_string(), "test-token".to_string()]
    );
}

#[tokio::test]
async fn explicit_reconnect_rejoins_subscription() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    let mut view = monitor.subscribe();
    monitor.connect().await.unwrap();
    let mut first = servers.recv().await.unwrap();
    monitor.join_session("t1").await.unwrap();
    assert_eq!(first.next_control().await, Some(join("t1")));

    monitor.disconnect();
    wait_until(&mut view, |s| {
        s.subscription.as_ref().is_some_and(|sub| sub.needs_rejoin)
    })
    .await;

    monitor.connect().await.unwrap();
    let mut second = servers.recv().await.unwrap();
    assert_eq!(second.next_control().await, Some(join("t1")));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_sent_while_connected() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor =
        PipelineMonitor::with_dialer(dialer, &MonitorConfig::default(), test_credential());
    let mut view = monitor.subscribe();
    monitor.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();

    match server.next_message().await {
        Some(ClientMessage::Heartbeat { .. }) => {}
        other => panic!("expected heartbeat, got {other:?}"),
    }
    server.push(json!({"type": "HeartbeatAck", "timestamp": "2026-10-19T10:00:30Z"}));
    let snap = wait_until(&mut view, |s| s.last_heartbeat_ack.is_some()).await;
    assert_eq!(snap.stats.applied, 1);

    monitor.send_heartbeat().unwrap();
    assert!(matches!(
        server.next_message().await,
        Some(ClientMessage::Heartbeat { .. })
    ));
}

#[tokio::test]
async fn credential_expiry_disconnects_with_reason() {
    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = PipelineMonitor::with_dialer(dialer, &quiet_config(), test_credential());
    monitor.connect().await.unwrap();
    let mut server = servers.recv().await.unwrap();

    monitor.credential_expired();
    assert_eq!(monitor.connection_state(), ConnectionState::Disconnected);
    assert_eq!(monitor.connection_error().as_deref(), Some("credential expired"));
    assert_eq!(server.next_message().await, None);
    assert_eq!(
        monitor.send_heartbeat(),
        Err(ChannelError::NotConnected)
    );
}

// =============================================================================
// Real servers
// =============================================================================

async fn spawn_server(app: Router) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

/// Minimal pipeline hub: requires a bearer token, and on `JoinSession`
/// replays a short run for that test.
fn hub() -> Router {
    Router::new().route(
        "/hubs/pipeline",
        any(|headers: HeaderMap, ws: WebSocketUpgrade| async move {
            let authorized = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some("Bearer hub-token");
            if !authorized {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            ws.on_upgrade(run_hub).into_response()
        }),
    )
}

async fn run_hub(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(ClientMessage::JoinSession { test_id }) =
            serde_json::from_str::<ClientMessage>(text.as_str())
        else {
            continue;
        };
        for event in [
            joined(&test_id),
            test_started(&test_id, &["intent", "sql"]),
            step_started(&test_id, "intent"),
            json!({
                "type": "StepProgress",
                "TestId": test_id,
                "StepName": "intent",
                "ProgressPercent": 60
            }),
            step_completed(&test_id, "intent", json!({"intent": "aggregate"})),
        ] {
            if socket.send(WsMessage::Text(event.to_string().into())).await.is_err() {
                return;
            }
        }
    }
}

#[tokio::test]
async fn ws_dialer_rejects_missing_token() {
    let addr = spawn_server(hub()).await;
    let err = match WsDialer
        .dial(&format!("ws://{addr}/hubs/pipeline"), "wrong-token")
        .await
    {
        Ok(_) => panic!("handshake should be rejected"),
        Err(e) => e,
    };
    match err {
        ChannelError::NegotiationFailed(reason) => assert!(reason.contains("401"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn ws_dialer_refused_connection_is_transport_error() {
    let err = match WsDialer.dial("ws://127.0.0.1:1/hubs/pipeline", "t").await {
        Ok(_) => panic!("nothing listens on port 1"),
        Err(e) => e,
    };
    assert!(matches!(err, ChannelError::Transport(_)));
}

#[tokio::test]
async fn monitor_over_websocket_hub() {
    let addr = spawn_server(hub()).await;
    let mut config = quiet_config();
    config.push_url = format!("ws://{addr}/hubs/pipeline");
    let credentials = Arc::new(|| Some("hub-token".to_string()));
    let monitor = PipelineMonitor::new(&config, credentials);
    let mut view = monitor.subscribe();

    monitor.connect().await.unwrap();
    assert_eq!(monitor.connection_state(), ConnectionState::Connected);
    monitor.begin_job("ws-1").await.unwrap();
    monitor.join_session("ws-1").await.unwrap();

    let snap = wait_received(&mut view, 5).await;
    let session = snap.session.as_ref().unwrap();
    assert_eq!(session.session_id, "session-ws-1");
    assert_eq!(session.requested_steps, vec!["intent", "sql"]);
    assert_eq!(snap.steps["intent"].status, StepStatus::Completed);
    assert_eq!(snap.steps["sql"].status, StepStatus::Pending);
    assert_eq!(snap.stats.malformed, 0);
    assert!(snap.subscription.unwrap().joined_at.is_some());
}

#[tokio::test]
async fn run_pipeline_test_end_to_end() {
    let release = Arc::new(Notify::new());
    let api_app = {
        let release = release.clone();
        Router::new().route(
            "/api/pipeline/test",
            post(move |Json(body): Json<Value>| {
                let release = release.clone();
                async move {
                    // hold the batch response until telemetry has streamed
                    release.notified().await;
                    Json(json!({
                        "success": true,
                        "totalDurationMs": 4200,
                        "results": {
                            "sql": {"success": true, "DurationMs": 700, "testId": body["testId"]}
                        }
                    }))
                }
            }),
        )
    };
    let api_addr = spawn_server(api_app).await;
    let api = ApiConfig::from_file(&EndpointFileConfig {
        api_base_url: format!("http://{api_addr}"),
        ..Default::default()
    });
    let client = PipelineClient::new(api, test_credential()).unwrap();

    let (dialer, mut servers) = ScriptedDialer::new();
    let monitor = Arc::new(PipelineMonitor::with_dialer(
        dialer,
        &quiet_config(),
        test_credential(),
    ));
    let mut view = monitor.subscribe();

    let mut request = PipelineTestRequest::new("revenue by region", ["intent", "sql"]);
    request.test_id = "run-1".to_string();
    let run = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run_pipeline_test(&client, request).await })
    };

    let mut server = timeout(TEST_TIMEOUT, servers.recv()).await.unwrap().unwrap();
    assert_eq!(server.next_control().await, Some(join("run-1")));
    server.push(joined("run-1"));
    server.push(test_started("run-1", &["intent", "sql"]));
    server.push(step_started("run-1", "intent"));
    server.push(step_completed("run-1", "intent", json!({"durationMs": 1500})));
    wait_received(&mut view, 4).await;

    release.notify_one();
    let result = timeout(TEST_TIMEOUT, run).await.unwrap().unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.total_duration_ms, 4200);
    assert_eq!(result.step("intent").unwrap().source, StepSource::Telemetry);
    assert_eq!(result.step("intent").unwrap().result.duration_ms, Some(2000));
    let sql = result.step("sql").unwrap();
    assert_eq!(sql.source, StepSource::Batch);
    assert_eq!(sql.result.duration_ms, Some(700));
    assert_eq!(sql.result.data.get("testId"), Some(&json!("run-1")));
}
