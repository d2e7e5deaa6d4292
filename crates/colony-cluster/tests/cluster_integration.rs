#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use colony_cluster::{
    ConnectionState, NodeConfig, NodeSyncManager, PeerConfig, PeerEvent, PeerLink,
    PeerLinkSettings, PeerMessage, SyncEvent, HEARTBEAT_TIMEOUT,
};
use colony_core::{ClusterBroadcast, ColonyError, ColonyResult, TaskExecutor, TaskRequest};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Answers every task with the node name and the action it ran.
struct NamedExecutor {
    name: &'static str,
    calls: AtomicUsize,
}

impl NamedExecutor {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskExecutor for NamedExecutor {
    async fn execute(&self, request: TaskRequest) -> ColonyResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"node": self.name, "action": request.action}))
    }
}

fn fast_settings() -> PeerLinkSettings {
    PeerLinkSettings {
        heartbeat_interval_ms: 1_000,
        connection_timeout_ms: 1_000,
        task_timeout_ms: 2_000,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 20,
    }
}

fn node_config(name: &str, peers: Vec<PeerConfig>) -> NodeConfig {
    NodeConfig {
        node_name: name.to_string(),
        host: "127.0.0.1".to_string(),
        listen_port: 0,
        peers,
        ..NodeConfig::default()
    }
}

async fn start_node(name: &str, peers: Vec<PeerConfig>) -> (NodeSyncManager, String) {
    let node = NodeSyncManager::new(node_config(name, peers), fast_settings());
    let addr = node.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    (node, format!("127.0.0.1:{}", addr.port()))
}

async fn wait_for<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn next_matching<T: Clone, F: Fn(&T) -> bool>(
    rx: &mut broadcast::Receiver<T>,
    predicate: F,
    within: Duration,
) -> Option<T> {
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Server surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_health_endpoint() {
    let (node, addr) = start_node("alpha", vec![]).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "colony");
    assert_eq!(body["node"], "alpha");
    assert_eq!(body["peers"], 0);
    node.shutdown().await;
}

#[tokio::test]
async fn test_inbound_task_answered_once() {
    let (node, addr) = start_node("alpha", vec![]).await;
    let executor = NamedExecutor::new("alpha");
    node.set_executor(executor.clone());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let frame = PeerMessage::task("abc123", &TaskRequest::new("explore", "map the ridge")).unwrap();
    ws.send(Message::Text(frame.to_json().unwrap())).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "task_response");
    assert_eq!(reply["taskId"], "abc123");
    assert_eq!(reply["result"]["node"], "alpha");
    assert_eq!(reply["result"]["action"], "explore");
    assert!(reply.get("error").is_none());

    // No second response for the same task.
    let extra = tokio::time::timeout(Duration::from_millis(150), ws.next()).await;
    assert!(extra.is_err());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    node.shutdown().await;
}

#[tokio::test]
async fn test_invalid_frames_are_dropped_and_connection_survives() {
    let (node, addr) = start_node("alpha", vec![]).await;
    node.set_executor(NamedExecutor::new("alpha"));
    let mut events = node.subscribe();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"self_destruct"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"task","payload":{}}"#.into()))
        .await
        .unwrap();

    for _ in 0..3 {
        let invalid = next_matching(
            &mut events,
            |e| matches!(e, SyncEvent::InvalidMessage { .. }),
            Duration::from_secs(1),
        )
        .await;
        assert!(invalid.is_some());
    }

    let frame = PeerMessage::task("t1", &TaskRequest::new("explore", "still here")).unwrap();
    ws.send(Message::Text(frame.to_json().unwrap())).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
    assert_eq!(reply["taskId"], "t1");
    node.shutdown().await;
}

#[tokio::test]
async fn test_task_without_executor_gets_error_response() {
    let (node, addr) = start_node("alpha", vec![]).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    let frame = PeerMessage::task("t9", &TaskRequest::new("explore", "anyone?")).unwrap();
    ws.send(Message::Text(frame.to_json().unwrap())).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
    assert_eq!(reply["type"], "task_response");
    assert!(reply["error"].as_str().unwrap().contains("no task executor"));
    node.shutdown().await;
}

#[tokio::test]
async fn test_client_without_pong_is_terminated() {
    let mut config = node_config("alpha", vec![]);
    config.client_heartbeat_interval_ms = 40;
    let node = NodeSyncManager::new(config, fast_settings());
    let addr = node.start().await.unwrap();
    let mut events = node.subscribe();

    // Never polled after the handshake, so pings go unanswered.
    let (_ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", addr.port()))
        .await
        .unwrap();

    let gone = next_matching(
        &mut events,
        |e| matches!(e, SyncEvent::ClientDisconnected { .. }),
        Duration::from_secs(2),
    )
    .await;
    assert!(gone.is_some());
    assert_eq!(node.client_count().await, 0);
    node.shutdown().await;
}

// ---------------------------------------------------------------------------
// Peer links
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_reconnect_backoff_until_cap() {
    let port = free_port().await;
    let link = PeerLink::new(
        PeerConfig::new(format!("ws://127.0.0.1:{port}/ws")),
        fast_settings(),
        1024 * 1024,
    );
    let mut rx = link.subscribe();
    assert!(link.connect().await.is_err());

    let mut delays = Vec::new();
    let mut capped = false;
    let collected = tokio::time::timeout(Duration::from_secs(3), async {
        while let Ok(event) = rx.recv().await {
            match event {
                PeerEvent::ReconnectScheduled { delay_ms, .. } => delays.push(delay_ms),
                PeerEvent::MaxReconnectReached { .. } => {
                    capped = true;
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(collected.is_ok());
    assert_eq!(delays, vec![20, 30, 45]);
    assert!(capped);
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert_eq!(link.status().reconnect_attempts, 3);
}

#[tokio::test]
async fn test_silent_peer_times_out_and_fails_pending() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // Hold the socket open without ever reading or writing.
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let settings = PeerLinkSettings {
        heartbeat_interval_ms: 60,
        task_timeout_ms: 5_000,
        max_reconnect_attempts: 0,
        ..fast_settings()
    };
    let link = PeerLink::new(
        PeerConfig::new(format!("ws://127.0.0.1:{port}/ws")),
        settings,
        1024 * 1024,
    );
    let mut rx = link.subscribe();
    link.connect().await.unwrap();
    assert!(link.is_connected());

    let sender = link.clone();
    let pending = tokio::spawn(async move {
        sender
            .send_task(TaskRequest::new("explore", "into the void"))
            .await
    });
    assert!(wait_for(|| link.active_tasks() == 1, Duration::from_secs(1)).await);

    let dropped = next_matching(
        &mut rx,
        |e| matches!(e, PeerEvent::Disconnected { .. }),
        Duration::from_secs(2),
    )
    .await;
    match dropped {
        Some(PeerEvent::Disconnected { reason, .. }) => assert_eq!(reason, HEARTBEAT_TIMEOUT),
        other => panic!("expected disconnect, got {other:?}"),
    }

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ColonyError::PeerDisconnected { .. })));
    assert_eq!(link.active_tasks(), 0);
    assert_eq!(link.status().failed_tasks, 1);
}

#[tokio::test]
async fn test_destroy_stops_reconnecting() {
    let port = free_port().await;
    let settings = PeerLinkSettings {
        reconnect_base_delay_ms: 200,
        ..fast_settings()
    };
    let link = PeerLink::new(PeerConfig::new(format!("ws://127.0.0.1:{port}/ws")), settings, 1024);
    assert!(link.connect().await.is_err());
    assert_eq!(link.status().reconnect_attempts, 1);
    link.destroy();

    // Only events raised after teardown matter here.
    let mut rx = link.subscribe();
    let reconnect = next_matching(
        &mut rx,
        |e| matches!(e, PeerEvent::Connecting { attempt, .. } if *attempt > 0),
        Duration::from_millis(400),
    )
    .await;
    assert!(reconnect.is_none());
    assert!(!link.is_enabled());
}

#[tokio::test]
async fn test_default_settings_retry_ten_times() {
    let port = free_port().await;
    let settings = PeerLinkSettings {
        reconnect_base_delay_ms: 2,
        connection_timeout_ms: 500,
        ..PeerLinkSettings::default()
    };
    assert_eq!(settings.max_reconnect_attempts, 10);
    let link = PeerLink::new(
        PeerConfig::new(format!("ws://127.0.0.1:{port}/ws")),
        settings.clone(),
        1024,
    );
    let mut rx = link.subscribe();
    assert!(link.connect().await.is_err());

    let mut scheduled = Vec::new();
    let mut capped = false;
    let collected = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(event) = rx.recv().await {
            match event {
                PeerEvent::ReconnectScheduled {
                    attempt, delay_ms, ..
                } => scheduled.push((attempt, delay_ms)),
                PeerEvent::MaxReconnectReached { .. } => {
                    capped = true;
                    break;
                }
                _ => {}
            }
        }
    })
    .await;
    assert!(collected.is_ok());
    assert!(capped);

    let expected: Vec<(u32, u64)> = (0..10)
        .map(|n| (n + 1, settings.reconnect_delay(n).as_millis() as u64))
        .collect();
    assert_eq!(scheduled, expected);
    assert_eq!(scheduled[1].1, 3);
    assert_eq!(scheduled[9].1, 77);
    assert_eq!(link.status().reconnect_attempts, 10);
}

#[tokio::test]
async fn test_dropped_peer_reconnects_and_resets_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(listener);
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = ws.close(None).await;
    });

    let settings = PeerLinkSettings {
        reconnect_base_delay_ms: 100,
        max_reconnect_attempts: 10,
        connection_timeout_ms: 500,
        ..fast_settings()
    };
    let link = PeerLink::new(
        PeerConfig::new(format!("ws://127.0.0.1:{port}/ws")),
        settings,
        1024 * 1024,
    );
    let mut rx = link.subscribe();
    link.connect().await.unwrap();

    let dropped = next_matching(
        &mut rx,
        |e| matches!(e, PeerEvent::Disconnected { .. }),
        Duration::from_secs(2),
    )
    .await;
    assert!(dropped.is_some());

    // Nothing listens for a while, so the first retry fails as well.
    let retrying = next_matching(
        &mut rx,
        |e| matches!(e, PeerEvent::ReconnectScheduled { attempt: 2, .. }),
        Duration::from_secs(2),
    )
    .await;
    assert!(retrying.is_some());
    assert_eq!(link.status().reconnect_attempts, 2);

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let back = next_matching(
        &mut rx,
        |e| matches!(e, PeerEvent::Connected { .. }),
        Duration::from_secs(2),
    )
    .await;
    assert!(back.is_some());
    assert!(link.is_connected());
    assert_eq!(link.status().reconnect_attempts, 0);
}

// ---------------------------------------------------------------------------
// Node to node
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_delegate_round_trip_between_nodes() {
    let (beta, beta_addr) = start_node("beta", vec![]).await;
    beta.set_executor(NamedExecutor::new("beta"));

    let (alpha, _) = start_node("alpha", vec![PeerConfig::new(format!("ws://{beta_addr}/ws"))]).await;
    assert!(wait_for(|| alpha.connected_peers() == 1, Duration::from_secs(2)).await);

    let result = alpha
        .delegate(TaskRequest::new("explore", "scout the east"))
        .await
        .unwrap();
    assert_eq!(result["node"], "beta");

    let status = &alpha.peer_statuses()[0];
    assert_eq!(status.completed_tasks, 1);
    assert_eq!(status.active_tasks, 0);

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_delegate_prefers_priority_then_specialization() {
    let (low, low_addr) = start_node("low", vec![]).await;
    low.set_executor(NamedExecutor::new("low"));
    let (high, high_addr) = start_node("high", vec![]).await;
    high.set_executor(NamedExecutor::new("high"));

    let peers = vec![
        PeerConfig::new(format!("ws://{low_addr}/ws")).with_priority(1),
        PeerConfig::new(format!("ws://{high_addr}/ws"))
            .with_priority(5)
            .with_specialization(["explore"]),
    ];
    let (alpha, _) = start_node("alpha", peers).await;
    assert!(wait_for(|| alpha.connected_peers() == 2, Duration::from_secs(2)).await);

    let explore = alpha
        .delegate(TaskRequest::new("explore", "north"))
        .await
        .unwrap();
    assert_eq!(explore["node"], "high");

    let gather = alpha
        .delegate(TaskRequest::new("gather", "wood"))
        .await
        .unwrap();
    assert_eq!(gather["node"], "low");

    alpha.shutdown().await;
    low.shutdown().await;
    high.shutdown().await;
}

#[tokio::test]
async fn test_delegate_surfaces_remote_error() {
    let (beta, beta_addr) = start_node("beta", vec![]).await;
    let (alpha, _) = start_node("alpha", vec![PeerConfig::new(format!("ws://{beta_addr}/ws"))]).await;
    assert!(wait_for(|| alpha.connected_peers() == 1, Duration::from_secs(2)).await);

    let err = alpha
        .delegate(TaskRequest::new("explore", "nobody home"))
        .await
        .unwrap_err();
    assert!(matches!(err, ColonyError::DispatchFailed { .. }));
    assert_eq!(alpha.peer_statuses()[0].failed_tasks, 1);

    alpha.shutdown().await;
    beta.shutdown().await;
}

#[tokio::test]
async fn test_cluster_event_reaches_every_peer() {
    let (beta, beta_addr) = start_node("beta", vec![]).await;
    let (gamma, gamma_addr) = start_node("gamma", vec![]).await;

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    for node in [&beta, &gamma] {
        let sink = seen.clone();
        node.register_handler("collab_session_created", move |msg| {
            sink.lock().push((msg.message.from.clone(), msg.message.data.clone()));
        });
    }

    let peers = vec![
        PeerConfig::new(format!("ws://{beta_addr}/ws")),
        PeerConfig::new(format!("ws://{gamma_addr}/ws")),
    ];
    let (alpha, _) = start_node("alpha", peers).await;
    assert!(wait_for(|| alpha.connected_peers() == 2, Duration::from_secs(2)).await);

    let sent = alpha.broadcast_cluster_event("collab_session_created", json!({"sessionId": "s1"}));
    assert_eq!(sent, 2);
    assert!(wait_for(|| seen.lock().len() == 2, Duration::from_secs(2)).await);
    for (from, data) in seen.lock().iter() {
        assert_eq!(from.as_deref(), Some("alpha"));
        assert_eq!(data.as_ref().unwrap()["sessionId"], "s1");
    }

    alpha.shutdown().await;
    beta.shutdown().await;
    gamma.shutdown().await;
}
