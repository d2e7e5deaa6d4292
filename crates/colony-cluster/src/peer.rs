use crate::config::{PeerConfig, PeerLinkSettings};
use crate::protocol::{is_allowed_type, message_types, random_task_id, PeerMessage};
use chrono::{DateTime, Utc};
use colony_core::{ColonyError, ColonyResult, CompletionMap, Task, TaskAction, TaskRequest};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type PeerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason reported when the peer stays silent past the heartbeat deadline.
pub const HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

/// Connection state of a [`PeerLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle and traffic notifications from a [`PeerLink`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connecting { peer: String, attempt: u32 },
    Connected { peer: String },
    Disconnected { peer: String, reason: String },
    ReconnectScheduled { peer: String, attempt: u32, delay_ms: u64 },
    MaxReconnectReached { peer: String },
    /// A valid frame other than a heartbeat or a task response.
    Message { peer: String, message: PeerMessage },
    InvalidMessage { peer: String, reason: String },
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    pub url: String,
    pub display_name: String,
    pub state: ConnectionState,
    pub enabled: bool,
    pub specialization: Vec<String>,
    pub weight: u32,
    pub priority: i32,
    pub reconnect_attempts: u32,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

struct LinkState {
    connection: ConnectionState,
    enabled: bool,
    destroyed: bool,
    reconnect_attempts: u32,
    /// Set once the reconnect cap is hit; cleared by the next successful connect.
    gave_up: bool,
    /// Bumped on every connect attempt and teardown; stale sessions compare against it.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    last_inbound: Instant,
    last_heartbeat: Option<DateTime<Utc>>,
}

struct LinkInner {
    config: PeerConfig,
    settings: PeerLinkSettings,
    max_message_bytes: usize,
    state: Mutex<LinkState>,
    pending: CompletionMap<String, Value>,
    events: broadcast::Sender<PeerEvent>,
}

/// Durable, auto-reconnecting channel to one peer node.
///
/// Every pending task has a live deadline timer. Losing the connection fails
/// all pending tasks before the map is cleared, then schedules a reconnect
/// after `base * 1.5^attempts`, up to the attempt cap.
#[derive(Clone)]
pub struct PeerLink {
    inner: Arc<LinkInner>,
}

impl PeerLink {
    pub fn new(config: PeerConfig, settings: PeerLinkSettings, max_message_bytes: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        let enabled = config.enabled;
        Self {
            inner: Arc::new(LinkInner {
                config,
                settings,
                max_message_bytes,
                state: Mutex::new(LinkState {
                    connection: ConnectionState::Disconnected,
                    enabled,
                    destroyed: false,
                    reconnect_attempts: 0,
                    gave_up: false,
                    generation: 0,
                    outbound: None,
                    session: None,
                    reconnect: None,
                    last_inbound: Instant::now(),
                    last_heartbeat: None,
                }),
                pending: CompletionMap::new(),
                events,
            }),
        }
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_enabled(&self) -> bool {
        let state = self.inner.state.lock();
        state.enabled && !state.destroyed
    }

    pub fn can_handle(&self, action: TaskAction) -> bool {
        self.inner.config.can_handle(action)
    }

    /// Tasks awaiting a response. Always equal to the pending map size.
    pub fn active_tasks(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn status(&self) -> PeerStatus {
        let state = self.inner.state.lock();
        let stats = self.inner.pending.stats();
        PeerStatus {
            url: self.inner.config.url.clone(),
            display_name: self.inner.config.name().to_string(),
            state: state.connection,
            enabled: state.enabled && !state.destroyed,
            specialization: self.inner.config.specialization.clone(),
            weight: self.inner.config.weight,
            priority: self.inner.config.priority,
            reconnect_attempts: state.reconnect_attempts,
            active_tasks: self.inner.pending.len(),
            completed_tasks: stats.succeeded(),
            failed_tasks: stats.failed() + stats.cancelled(),
            last_heartbeat: state.last_heartbeat,
        }
    }

    /// Open the connection. A no-op when already connecting or connected.
    ///
    /// On failure the link schedules its own reconnect and the error is
    /// returned for the caller's information. The reconnect cap only limits
    /// those scheduled retries; an explicit call always makes an attempt.
    pub async fn connect(&self) -> ColonyResult<()> {
        let (generation, attempt) = {
            let mut state = self.inner.state.lock();
            if state.destroyed || !state.enabled {
                return Err(self.disconnected("link disabled"));
            }
            if state.connection != ConnectionState::Disconnected {
                return Ok(());
            }
            state.connection = ConnectionState::Connecting;
            state.generation += 1;
            (state.generation, state.reconnect_attempts)
        };

        info!(peer = %self.url(), attempt, "Connecting to peer");
        self.emit(PeerEvent::Connecting {
            peer: self.url().to_string(),
            attempt,
        });

        let outcome = tokio::time::timeout(
            self.inner.settings.connection_timeout(),
            tokio_tungstenite::connect_async(self.url()),
        )
        .await;

        let socket = match outcome {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(e)) => {
                let reason = format!("connect error: {e}");
                self.handle_disconnect(generation, &reason);
                return Err(self.disconnected(&reason));
            }
            Err(_) => {
                self.handle_disconnect(generation, "connection timeout");
                return Err(self.disconnected("connection timeout"));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.destroyed {
                return Err(self.disconnected("link torn down while connecting"));
            }
            state.connection = ConnectionState::Connected;
            state.reconnect_attempts = 0;
            state.gave_up = false;
            state.outbound = Some(tx);
            state.last_inbound = Instant::now();
            let link = self.clone();
            state.session = Some(tokio::spawn(async move {
                link.run_session(generation, socket, rx).await;
            }));
        }

        info!(peer = %self.url(), "Peer connected");
        self.emit(PeerEvent::Connected {
            peer: self.url().to_string(),
        });
        Ok(())
    }

    /// Queue a frame for the writer. Fails unless connected.
    pub fn send_frame(&self, message: &PeerMessage) -> ColonyResult<()> {
        let text = message.to_json()?;
        let state = self.inner.state.lock();
        if state.connection != ConnectionState::Connected {
            return Err(self.disconnected("not connected"));
        }
        match &state.outbound {
            Some(tx) => tx.send(text).map_err(|_| self.disconnected("writer closed")),
            None => Err(self.disconnected("not connected")),
        }
    }

    /// Delegate a task and wait for the peer's single `task_response`.
    ///
    /// Fails with [`ColonyError::PeerMaxReconnectReached`] once the link has
    /// given up reconnecting.
    pub async fn send_task(&self, request: TaskRequest) -> ColonyResult<Value> {
        if !self.is_connected() {
            return Err(self.not_connected_error());
        }
        let task = Task::admit(request)?;
        if !self.can_handle(task.action) {
            return Err(ColonyError::NoCapableAgent {
                action: task.action,
            });
        }

        let task_id = random_task_id()?;
        let frame = PeerMessage::task(task_id.clone(), &task.to_request())?;
        let peer = self.url().to_string();
        let timeout_id = task_id.clone();
        let handle = self.inner.pending.register(
            task_id.clone(),
            self.inner.settings.task_timeout(),
            move || ColonyError::TaskTimeout {
                agent_id: peer,
                task_id: timeout_id,
            },
        );

        debug!(peer = %self.url(), task_id = %task_id, action = %task.action, "Delegating task");
        if let Err(e) = self.send_frame(&frame) {
            self.inner.pending.resolve(&task_id, Err(e));
        }
        handle.wait().await
    }

    /// Disable the link for good: cancel timers, close the transport, fail pending tasks.
    pub fn destroy(&self) {
        let (session, reconnect) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.enabled = false;
            state.generation += 1;
            state.connection = ConnectionState::Disconnected;
            state.outbound = None;
            (state.session.take(), state.reconnect.take())
        };
        if let Some(handle) = session {
            handle.abort();
        }
        if let Some(handle) = reconnect {
            handle.abort();
        }
        let failed = self
            .inner
            .pending
            .fail_all(|| self.disconnected("link destroyed"));
        info!(peer = %self.url(), failed, "Peer link destroyed");
        self.emit(PeerEvent::Disconnected {
            peer: self.url().to_string(),
            reason: "destroyed".to_string(),
        });
    }

    async fn run_session(
        &self,
        generation: u64,
        socket: PeerSocket,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        let (mut write, mut read) = socket.split();
        let interval = self.inner.settings.heartbeat_interval();
        let deadline = self.inner.settings.heartbeat_deadline();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        let reason = loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            break format!("send error: {e}");
                        }
                    }
                    None => break "writer closed".to_string(),
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.touch();
                        self.handle_inbound(&text);
                    }
                    Some(Ok(Message::Close(_))) | None => break "connection closed".to_string(),
                    Some(Ok(_)) => self.touch(),
                    Some(Err(e)) => break format!("transport error: {e}"),
                },
                _ = ticker.tick() => {
                    if self.silence() > deadline {
                        break HEARTBEAT_TIMEOUT.to_string();
                    }
                    let beat = match PeerMessage::heartbeat().to_json() {
                        Ok(beat) => beat,
                        Err(e) => break format!("encode error: {e}"),
                    };
                    if let Err(e) = write.send(Message::Text(beat)).await {
                        break format!("send error: {e}");
                    }
                }
            }
        };

        let _ = write.close().await;
        self.handle_disconnect(generation, &reason);
    }

    fn handle_inbound(&self, raw: &str) {
        let message = match PeerMessage::parse(raw, self.inner.max_message_bytes, self.url()) {
            Ok(m) if is_allowed_type(&m.kind) => m,
            Ok(m) => {
                self.reject(format!("unknown frame type '{}'", m.kind));
                return;
            }
            Err(e) => {
                self.reject(e.to_string());
                return;
            }
        };

        match message.kind.as_str() {
            message_types::HEARTBEAT => {
                debug!(peer = %self.url(), "Heartbeat received");
            }
            message_types::TASK_RESPONSE => {
                let task_id = message.task_id.unwrap_or_default();
                let result = match message.error {
                    Some(cause) => Err(ColonyError::DispatchFailed { cause }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                if !self.inner.pending.resolve(&task_id, result) {
                    debug!(peer = %self.url(), task_id = %task_id, "Response for unknown task ignored");
                }
            }
            _ => self.emit(PeerEvent::Message {
                peer: self.url().to_string(),
                message,
            }),
        }
    }

    fn handle_disconnect(&self, generation: u64, reason: &str) {
        let (schedule, attempts) = {
            let mut state = self.inner.state.lock();
            if state.generation != generation || state.connection == ConnectionState::Disconnected
            {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.outbound = None;
            state.session = None;
            (state.enabled && !state.destroyed, state.reconnect_attempts)
        };

        let err = self.disconnected(reason);
        let failed = self.inner.pending.fail_all(|| err.clone());
        warn!(peer = %self.url(), reason, failed, "Peer disconnected");
        self.emit(PeerEvent::Disconnected {
            peer: self.url().to_string(),
            reason: reason.to_string(),
        });

        if !schedule {
            return;
        }
        if attempts >= self.inner.settings.max_reconnect_attempts {
            self.inner.state.lock().gave_up = true;
            warn!(peer = %self.url(), attempts, "Peer reached max reconnect attempts");
            self.emit(PeerEvent::MaxReconnectReached {
                peer: self.url().to_string(),
            });
            return;
        }

        let delay = self.inner.settings.reconnect_delay(attempts);
        let link = self.clone();
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        state.reconnect_attempts = attempts + 1;
        if let Some(previous) = state.reconnect.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = link.connect().await;
        })) {
            previous.abort();
        }
        drop(state);

        debug!(peer = %self.url(), attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.emit(PeerEvent::ReconnectScheduled {
            peer: self.url().to_string(),
            attempt: attempts + 1,
            delay_ms: delay.as_millis() as u64,
        });
    }

    fn touch(&self) {
        let mut state = self.inner.state.lock();
        state.last_inbound = Instant::now();
        state.last_heartbeat = Some(Utc::now());
    }

    fn silence(&self) -> std::time::Duration {
        self.inner.state.lock().last_inbound.elapsed()
    }

    fn reject(&self, reason: String) {
        warn!(peer = %self.url(), reason = %reason, "Invalid frame from peer dropped");
        self.emit(PeerEvent::InvalidMessage {
            peer: self.url().to_string(),
            reason,
        });
    }

    fn not_connected_error(&self) -> ColonyError {
        let gave_up = self.inner.state.lock().gave_up;
        if gave_up {
            ColonyError::PeerMaxReconnectReached {
                peer: self.url().to_string(),
            }
        } else {
            self.disconnected("not connected")
        }
    }

    fn disconnected(&self, reason: &str) -> ColonyError {
        ColonyError::PeerDisconnected {
            peer: self.url().to_string(),
            reason: reason.to_string(),
        }
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn link() -> PeerLink {
        PeerLink::new(
            PeerConfig::new("ws://127.0.0.1:1/ws").with_specialization(["mine"]),
            PeerLinkSettings::default(),
            1024,
        )
    }

    #[tokio::test]
    async fn test_send_task_requires_connection() {
        let link = link();
        let err = link
            .send_task(TaskRequest::new("explore", "look"))
            .await
            .unwrap_err();
        assert!(matches!(err, ColonyError::PeerDisconnected { .. }));
        assert_eq!(link.active_tasks(), 0);
    }

    #[test]
    fn test_initial_status() {
        let status = link().status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.enabled);
        assert_eq!(status.active_tasks, 0);
        assert_eq!(status.specialization, vec!["mine".to_string()]);
        assert!(status.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn test_destroyed_link_refuses_connect() {
        let link = link();
        link.destroy();
        assert!(!link.is_enabled());
        assert!(matches!(
            link.connect().await,
            Err(ColonyError::PeerDisconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_peer_does_not_connect() {
        let mut config = PeerConfig::new("ws://127.0.0.1:1/ws");
        config.enabled = false;
        let link = PeerLink::new(config, PeerLinkSettings::default(), 1024);
        assert!(link.connect().await.is_err());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_zero_cap_still_makes_first_attempt() {
        let settings = PeerLinkSettings {
            max_reconnect_attempts: 0,
            connection_timeout_ms: 1_000,
            ..PeerLinkSettings::default()
        };
        let link = PeerLink::new(PeerConfig::new("ws://127.0.0.1:1/ws"), settings, 1024);
        let mut rx = link.subscribe();

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, ColonyError::PeerDisconnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Connecting { attempt: 0, .. }));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Disconnected { .. }));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::MaxReconnectReached { .. }));

        let err = link
            .send_task(TaskRequest::new("explore", "anyone"))
            .await
            .unwrap_err();
        assert!(matches!(err, ColonyError::PeerMaxReconnectReached { .. }));
    }

    #[test]
    fn test_inbound_unknown_type_rejected() {
        let link = link();
        let mut rx = link.subscribe();
        link.handle_inbound(r#"{"type": "shutdown"}"#);
        link.handle_inbound("{{{");
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::InvalidMessage { .. }));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::InvalidMessage { .. }));
    }

    #[test]
    fn test_inbound_cluster_event_forwarded() {
        let link = link();
        let mut rx = link.subscribe();
        link.handle_inbound(r#"{"type": "collab_session_created", "data": {}, "from": "b"}"#);
        match rx.try_recv().unwrap() {
            PeerEvent::Message { message, .. } => assert_eq!(message.kind, "collab_session_created"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
