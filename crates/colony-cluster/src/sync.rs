use crate::config::{NodeConfig, PeerLinkSettings};
use crate::connection::{ClientConnection, ClientRegistry, Outgoing};
use crate::peer::{PeerEvent, PeerLink, PeerStatus};
use crate::protocol::{is_allowed_type, message_types, PeerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use colony_core::{
    ClusterBroadcast, ColonyError, ColonyResult, Task, TaskExecutor, TaskRequest,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where an inbound frame came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// An inbound WebSocket client of this node.
    Client(Uuid),
    /// A peer this node dialed, by URL.
    Peer(String),
}

/// A validated frame handed to a registered handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub source: MessageSource,
    pub message: PeerMessage,
}

/// Callback for one frame type.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Notifications from the sync manager.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ClientConnected { id: Uuid },
    ClientDisconnected { id: Uuid },
    /// A valid frame no handler claimed.
    Message(InboundMessage),
    InvalidMessage { source: MessageSource, reason: String },
    /// A task frame was executed and answered.
    TaskServed { source: MessageSource, task_id: String, success: bool },
}

struct SyncInner {
    config: NodeConfig,
    peers: Vec<PeerLink>,
    clients: Arc<ClientRegistry>,
    handlers: RwLock<HashMap<String, MessageHandler>>,
    executor: RwLock<Option<Arc<dyn TaskExecutor>>>,
    events: broadcast::Sender<SyncEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cluster membership for one node.
///
/// Serves `/ws` for inbound nodes and clients, keeps a [`PeerLink`] to every
/// configured peer, answers inbound `task` frames through the installed
/// [`TaskExecutor`], and delegates outbound tasks to the best capable peer.
#[derive(Clone)]
pub struct NodeSyncManager {
    inner: Arc<SyncInner>,
}

impl NodeSyncManager {
    pub fn new(config: NodeConfig, settings: PeerLinkSettings) -> Self {
        let peers = config
            .peers
            .iter()
            .cloned()
            .map(|peer| PeerLink::new(peer, settings.clone(), config.max_message_bytes))
            .collect();
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SyncInner {
                config,
                peers,
                clients: ClientRegistry::new(),
                handlers: RwLock::new(HashMap::new()),
                executor: RwLock::new(None),
                events,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn peers(&self) -> &[PeerLink] {
        &self.inner.peers
    }

    pub fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.inner.peers.iter().map(PeerLink::status).collect()
    }

    pub fn connected_peers(&self) -> usize {
        self.inner.peers.iter().filter(|p| p.is_connected()).count()
    }

    pub async fn client_count(&self) -> usize {
        self.inner.clients.connection_count().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Install the executor that serves inbound `task` frames.
    pub fn set_executor(&self, executor: Arc<dyn TaskExecutor>) {
        *self.inner.executor.write() = Some(executor);
    }

    /// Route every valid frame of `kind` to `handler`. Registering a type
    /// also admits it past the frame allow-list.
    pub fn register_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(InboundMessage) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(kind.into(), Arc::new(handler));
    }

    /// The axum app serving `/ws` and `/health`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.clone())
    }

    /// Bind the listener, start serving, and dial every enabled peer.
    /// Returns the bound address, which matters when the configured port is 0.
    pub async fn start(&self) -> ColonyResult<SocketAddr> {
        let bind = format!("{}:{}", self.inner.config.host, self.inner.config.listen_port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let addr = listener.local_addr()?;
        info!(node = %self.inner.config.node_name, %addr, "Node sync server listening");

        let app = self.router();
        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Node sync server stopped");
            }
        }));

        let clients = self.inner.clients.clone();
        let period = self.inner.config.client_heartbeat_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                clients.sweep().await;
            }
        }));

        for peer in &self.inner.peers {
            tasks.push(self.forward_peer_events(peer.clone()));
            let link = peer.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = link.connect().await {
                    debug!(peer = %link.url(), error = %e, "Initial peer connect failed");
                }
            }));
        }

        self.inner.tasks.lock().extend(tasks);
        Ok(addr)
    }

    /// Send a task to the best connected peer that can handle it.
    ///
    /// Candidates are ordered by priority, then weight, then fewest active
    /// tasks.
    pub async fn delegate(&self, request: TaskRequest) -> ColonyResult<Value> {
        let task = Task::admit(request)?;
        let mut candidates: Vec<&PeerLink> = self
            .inner
            .peers
            .iter()
            .filter(|p| p.is_connected() && p.is_enabled() && p.can_handle(task.action))
            .collect();
        candidates.sort_by(|a, b| {
            b.config()
                .priority
                .cmp(&a.config().priority)
                .then(b.config().weight.cmp(&a.config().weight))
                .then(a.active_tasks().cmp(&b.active_tasks()))
        });
        let Some(peer) = candidates.first() else {
            return Err(ColonyError::NoCapableAgent {
                action: task.action,
            });
        };
        info!(peer = %peer.url(), action = %task.action, "Delegating task to peer");
        peer.send_task(task.to_request()).await
    }

    /// Tear down peers, close clients, and stop background tasks.
    pub async fn shutdown(&self) {
        for peer in &self.inner.peers {
            peer.destroy();
        }
        let closed = self.inner.clients.close_all().await;
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(node = %self.inner.config.node_name, closed, "Node sync manager shut down");
    }

    fn forward_peer_events(&self, peer: PeerLink) -> JoinHandle<()> {
        let mut rx = peer.subscribe();
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(PeerEvent::Message { peer, message }) => {
                        manager.route(MessageSource::Peer(peer), message);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Peer event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn handle_raw(&self, source: MessageSource, raw: &str) {
        let origin = match &source {
            MessageSource::Client(id) => id.to_string(),
            MessageSource::Peer(url) => url.clone(),
        };
        match PeerMessage::parse(raw, self.inner.config.max_message_bytes, &origin) {
            Ok(message) if self.accepts(&message.kind) => self.route(source, message),
            Ok(message) => self.reject(source, format!("unknown frame type '{}'", message.kind)),
            Err(e) => self.reject(source, e.to_string()),
        }
    }

    fn accepts(&self, kind: &str) -> bool {
        is_allowed_type(kind) || self.inner.handlers.read().contains_key(kind)
    }

    fn route(&self, source: MessageSource, message: PeerMessage) {
        let handler = self.inner.handlers.read().get(&message.kind).cloned();
        if let Some(handler) = handler {
            handler(InboundMessage { source, message });
            return;
        }
        match message.kind.as_str() {
            message_types::TASK => self.serve_task(source, message),
            message_types::HEARTBEAT => {
                // Echo so the remote link sees traffic and keeps the connection.
                if let MessageSource::Client(id) = source {
                    let clients = self.inner.clients.clone();
                    tokio::spawn(async move {
                        if let Ok(beat) = PeerMessage::heartbeat().to_json() {
                            clients.send_to(id, Outgoing::Text(beat)).await;
                        }
                    });
                }
            }
            _ => {
                let _ = self
                    .inner
                    .events
                    .send(SyncEvent::Message(InboundMessage { source, message }));
            }
        }
    }

    fn serve_task(&self, source: MessageSource, message: PeerMessage) {
        let task_id = message.task_id.clone().unwrap_or_default();
        let request = message
            .payload
            .clone()
            .map(serde_json::from_value::<TaskRequest>)
            .transpose();
        let executor = self.inner.executor.read().clone();
        let manager = self.clone();

        tokio::spawn(async move {
            let outcome = match (request, executor) {
                (Ok(Some(request)), Some(executor)) => executor.execute(request).await,
                (Ok(Some(_)), None) => Err(ColonyError::DispatchFailed {
                    cause: "node has no task executor".to_string(),
                }),
                (Ok(None), _) => Err(ColonyError::InvalidPeerMessage {
                    peer: format!("{source:?}"),
                    reason: "task frame without payload".to_string(),
                }),
                (Err(e), _) => Err(ColonyError::from(e)),
            };
            let success = outcome.is_ok();
            let reply = match outcome {
                Ok(result) => PeerMessage::task_result(task_id.clone(), result),
                Err(e) => PeerMessage::task_error(task_id.clone(), e.to_string()),
            };
            if let Err(e) = manager.reply(&source, &reply).await {
                warn!(task_id = %task_id, error = %e, "Could not answer task");
            }
            let _ = manager.inner.events.send(SyncEvent::TaskServed {
                source,
                task_id,
                success,
            });
        });
    }

    async fn reply(&self, source: &MessageSource, message: &PeerMessage) -> ColonyResult<()> {
        match source {
            MessageSource::Client(id) => {
                let text = message.to_json()?;
                if self.inner.clients.send_to(*id, Outgoing::Text(text)).await {
                    Ok(())
                } else {
                    Err(ColonyError::NotFound(format!("client {id}")))
                }
            }
            MessageSource::Peer(url) => match self.inner.peers.iter().find(|p| p.url() == url.as_str()) {
                Some(peer) => peer.send_frame(message),
                None => Err(ColonyError::NotFound(format!("peer {url}"))),
            },
        }
    }

    fn reject(&self, source: MessageSource, reason: String) {
        warn!(source = ?source, reason = %reason, "Invalid frame dropped");
        let _ = self
            .inner
            .events
            .send(SyncEvent::InvalidMessage { source, reason });
    }
}

impl ClusterBroadcast for NodeSyncManager {
    fn broadcast_cluster_event(&self, event_type: &str, payload: Value) -> usize {
        let frame = PeerMessage::cluster_event(event_type, payload, self.inner.config.node_name.clone());
        let sent = self
            .inner
            .peers
            .iter()
            .filter(|peer| peer.send_frame(&frame).is_ok())
            .count();
        debug!(event_type, sent, "Cluster event broadcast");
        sent
    }
}

async fn health_handler(State(manager): State<NodeSyncManager>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "colony",
        "node": manager.inner.config.node_name,
        "clients": manager.client_count().await,
        "peers": manager.connected_peers(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(manager): State<NodeSyncManager>,
) -> impl IntoResponse {
    ws.max_message_size(manager.inner.config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, manager))
}

async fn handle_socket(socket: WebSocket, manager: NodeSyncManager) {
    let id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let alive = Arc::new(AtomicBool::new(true));

    manager
        .inner
        .clients
        .add(ClientConnection {
            id,
            tx,
            alive: alive.clone(),
        })
        .await;
    let _ = manager.inner.events.send(SyncEvent::ClientConnected { id });

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outgoing::Text(text) => Message::Text(text.into()),
                Outgoing::Ping => Message::Ping(axum::body::Bytes::new()),
                Outgoing::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let inbound = manager.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => inbound.handle_raw(MessageSource::Client(id), text.as_str()),
                Message::Pong(_) => alive.store(true, Ordering::SeqCst),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    manager.inner.clients.remove(id).await;
    let _ = manager
        .inner
        .events
        .send(SyncEvent::ClientDisconnected { id });
    info!(connection_id = %id, "Client disconnected");
}
