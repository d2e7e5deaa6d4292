use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Frame queued for an inbound client's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Ping,
    Close,
}

/// An inbound WebSocket client of this node.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: Uuid,
    pub tx: mpsc::UnboundedSender<Outgoing>,
    /// Cleared before each ping and set again by the pong.
    pub alive: Arc<AtomicBool>,
}

/// Live inbound clients keyed by connection id.
pub struct ClientRegistry {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, conn: ClientConnection) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(connection_id = %id, "Client added");
    }

    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(connection_id = %id, "Client removed");
        }
        removed
    }

    pub async fn send_to(&self, id: Uuid, frame: Outgoing) -> bool {
        match self.connections.read().await.get(&id) {
            Some(conn) => conn.tx.send(frame).is_ok(),
            None => false,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// One heartbeat sweep. Clients that never answered the previous ping are
    /// closed and removed; the rest are pinged. Returns the terminated ids.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let mut conns = self.connections.write().await;
        let dead: Vec<Uuid> = conns
            .values()
            .filter(|c| !c.alive.load(Ordering::SeqCst))
            .map(|c| c.id)
            .collect();
        for id in &dead {
            if let Some(conn) = conns.remove(id) {
                let _ = conn.tx.send(Outgoing::Close);
                tracing::warn!(connection_id = %id, "Client missed heartbeat, terminating");
            }
        }
        for conn in conns.values() {
            conn.alive.store(false, Ordering::SeqCst);
            let _ = conn.tx.send(Outgoing::Ping);
        }
        dead
    }

    /// Close every client and forget them.
    pub async fn close_all(&self) -> usize {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for (_, conn) in conns.drain() {
            let _ = conn.tx.send(Outgoing::Close);
        }
        count
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}
