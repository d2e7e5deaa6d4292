//! Cluster plumbing for a colony node.
//!
//! A node accepts WebSocket connections from other nodes and clients, keeps
//! an auto-reconnecting link to each configured peer, and exchanges JSON
//! frames with them: heartbeats, delegated tasks with their single response,
//! and `collab_*` events fanned out to every peer.
//!
//! # Main types
//!
//! - [`NodeSyncManager`] — `/ws` and `/health` server, frame routing, task delegation.
//! - [`PeerLink`] — One outbound peer connection with heartbeats and backoff.
//! - [`PeerMessage`] — The wire frame.
//! - [`ClientRegistry`] — Inbound clients and their ping/pong liveness.

/// Inbound client connections.
pub mod connection;
/// Node, peer, and link settings.
pub mod config;
/// Outbound peer links.
pub mod peer;
/// Wire frames.
pub mod protocol;
/// The node sync manager.
pub mod sync;

pub use config::{NodeConfig, PeerConfig, PeerLinkSettings};
pub use connection::{ClientConnection, ClientRegistry, Outgoing};
pub use peer::{ConnectionState, PeerEvent, PeerLink, PeerStatus, HEARTBEAT_TIMEOUT};
pub use protocol::{is_allowed_type, message_types, random_task_id, PeerMessage};
pub use sync::{InboundMessage, MessageHandler, MessageSource, NodeSyncManager, SyncEvent};
