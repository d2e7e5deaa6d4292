use crate::error::ColonyResult;
use crate::task::TaskRequest;
use async_trait::async_trait;
use serde_json::Value;

/// Event tags emitted by the collaboration engine onto the cluster.
pub mod collab_events {
    pub const SESSION_CREATED: &str = "collab_session_created";
    pub const PARTICIPANT_ADDED: &str = "collab_participant_added";
    pub const PARTICIPANT_REMOVED: &str = "collab_participant_removed";
    pub const ASSIGNMENTS_UPDATED: &str = "collab_assignments_updated";
    pub const PROGRESS_UPDATED: &str = "collab_progress_updated";
    pub const SESSION_COMPLETED: &str = "collab_session_completed";

    /// Every tag above.
    pub const ALL: [&str; 6] = [
        SESSION_CREATED,
        PARTICIPANT_ADDED,
        PARTICIPANT_REMOVED,
        ASSIGNMENTS_UPDATED,
        PROGRESS_UPDATED,
        SESSION_COMPLETED,
    ];

    /// Prefix shared by all collaboration event tags.
    pub const PREFIX: &str = "collab_";
}

/// Fire-and-forget fan-out of an event to every peer node.
pub trait ClusterBroadcast: Send + Sync {
    /// Send `{type, data, from}` to every peer; returns how many sends succeeded.
    fn broadcast_cluster_event(&self, event_type: &str, payload: Value) -> usize;
}

/// Runs a task received from a peer and produces the value for its `task_response`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> ColonyResult<Value>;
}
