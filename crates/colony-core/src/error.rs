use crate::task::{Priority, TaskAction};
use uuid::Uuid;

/// Top-level error type for the colony scheduler.
///
/// Each variant is a distinct failure kind surfaced by one subsystem; callers
/// match on the variant rather than on the message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ColonyError {
    /// Task admission rejected; every violation is listed.
    #[error("Validation failed: {}", errors.join("; "))]
    ValidationFailed { errors: Vec<String> },

    /// The queue is saturated and the incoming task does not outrank its tail.
    #[error("Queue full: task {task_id} ({priority}) not admitted over tail priority {tail_priority}")]
    QueueFull {
        task_id: Uuid,
        priority: Priority,
        tail_priority: Priority,
    },

    /// No agent or peer is able to take the action.
    #[error("No capable agent or peer for action '{action}'")]
    NoCapableAgent { action: TaskAction },

    /// The bridge rejected or errored on a dispatch.
    #[error("Dispatch failed: {cause}")]
    DispatchFailed { cause: String },

    /// The per-task safety timer expired.
    #[error("Task {task_id} on agent '{agent_id}' timed out")]
    TaskTimeout { agent_id: String, task_id: String },

    /// A peer connection was lost or is not established.
    #[error("Peer {peer} disconnected: {reason}")]
    PeerDisconnected { peer: String, reason: String },

    /// A peer exhausted its reconnect budget.
    #[error("Peer {peer} reached the maximum number of reconnect attempts")]
    PeerMaxReconnectReached { peer: String },

    /// The autonomy controller has no oracle configured.
    #[error("Oracle unavailable")]
    OracleUnavailable,

    /// The oracle did not answer within its deadline.
    #[error("Oracle call {call_id} timed out after {timeout_ms} ms")]
    OracleTimeout { call_id: u64, timeout_ms: u64 },

    /// A peer frame was rejected at the transport level.
    #[error("Invalid message from {peer}: {reason}")]
    InvalidPeerMessage { peer: String, reason: String },

    /// Lookup of an unknown agent, session, or participant.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation conflicts with the current state (e.g. an illegal agent transition).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A pending operation was cancelled before it resolved.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for ColonyError {
    fn from(err: serde_json::Error) -> Self {
        ColonyError::Json(err.to_string())
    }
}

impl From<std::io::Error> for ColonyError {
    fn from(err: std::io::Error) -> Self {
        ColonyError::Io(err.to_string())
    }
}

impl ColonyError {
    /// Short machine-readable tag for the error kind, used in events and wire replies.
    pub fn kind(&self) -> &'static str {
        match self {
            ColonyError::ValidationFailed { .. } => "validation_failed",
            ColonyError::QueueFull { .. } => "queue_full",
            ColonyError::NoCapableAgent { .. } => "no_capable_agent",
            ColonyError::DispatchFailed { .. } => "dispatch_failed",
            ColonyError::TaskTimeout { .. } => "task_timeout",
            ColonyError::PeerDisconnected { .. } => "peer_disconnected",
            ColonyError::PeerMaxReconnectReached { .. } => "peer_max_reconnect_reached",
            ColonyError::OracleUnavailable => "oracle_unavailable",
            ColonyError::OracleTimeout { .. } => "oracle_timeout",
            ColonyError::InvalidPeerMessage { .. } => "invalid_peer_message",
            ColonyError::NotFound(_) => "not_found",
            ColonyError::Conflict(_) => "conflict",
            ColonyError::Cancelled(_) => "cancelled",
            ColonyError::Config(_) => "config",
            ColonyError::Json(_) => "json",
            ColonyError::Io(_) => "io",
        }
    }
}

/// A convenience `Result` alias using [`ColonyError`].
pub type ColonyResult<T> = Result<T, ColonyError>;
