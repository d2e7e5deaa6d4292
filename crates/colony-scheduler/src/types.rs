use chrono::{DateTime, Utc};
use colony_core::{Position, Priority, Task, TaskAction};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a worker agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Working,
    Offline,
}

impl AgentState {
    /// Transitions the dispatcher may perform directly. Offline is only
    /// reached through unregistration and left through re-registration.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (AgentState::Idle, AgentState::Working) | (AgentState::Working, AgentState::Idle)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Working => write!(f, "working"),
            AgentState::Offline => write!(f, "offline"),
        }
    }
}

/// A managed worker agent.
///
/// `state == Working` exactly when `current_task` is set; the registry is the
/// only place that changes either.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role: String,
    pub state: AgentState,
    pub current_task: Option<Task>,
    pub progress: u8,
    pub position: Option<Position>,
    pub awaiting_feedback: bool,
    pub last_update: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into().trim().to_ascii_lowercase(),
            state: AgentState::Idle,
            current_task: None,
            progress: 0,
            position: None,
            awaiting_feedback: false,
            last_update: Utc::now(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_idle(&self) -> bool {
        self.state == AgentState::Idle && self.current_task.is_none()
    }
}

/// How a dispatched task reached the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Bridge,
    Simulation,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Bridge => write!(f, "bridge"),
            Transport::Simulation => write!(f, "simulation"),
        }
    }
}

/// Why a task left its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Reported done by the bridge, by feedback, or by an explicit `complete`.
    Completed,
    /// Reported failed by feedback or an explicit `complete`.
    Failed,
    /// The per-task safety timer expired.
    Timeout,
    /// The bridge rejected or errored on dispatch.
    DispatchError,
    /// The agent was unregistered while working.
    AgentUnregistered,
    /// The scheduler shut down with the task in flight.
    Shutdown,
}

/// Final result of one task, as reported by `task_completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub agent_id: String,
    pub success: bool,
    pub reason: CompletionReason,
    pub error: Option<String>,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub submitted: u64,
    pub assigned: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub rejected: u64,
}

/// Roster entry in a [`StatusSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: String,
    pub role: String,
    pub state: AgentState,
    pub progress: u8,
    pub position: Option<Position>,
    pub current_task_id: Option<Uuid>,
    pub current_action: Option<TaskAction>,
}

impl From<&Agent> for AgentSnapshot {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id.clone(),
            role: agent.role.clone(),
            state: agent.state,
            progress: agent.progress,
            position: agent.position,
            current_task_id: agent.current_task.as_ref().map(|t| t.id),
            current_action: agent.current_task.as_ref().map(|t| t.action),
        }
    }
}

/// Queue entry summary in a [`StatusSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTaskSummary {
    pub task_id: Uuid,
    pub action: TaskAction,
    pub priority: Priority,
    pub details: String,
}

/// Point-in-time view of the scheduler, fed to the oracle and exposed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub agents: Vec<AgentSnapshot>,
    pub queue_depth: usize,
    pub queued: Vec<QueuedTaskSummary>,
    pub metrics: DispatchMetrics,
    pub generated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn working_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.state == AgentState::Working)
            .count()
    }

    pub fn idle_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| a.state == AgentState::Idle)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_creation() {
        let agent = Agent::new("a1", " Miner ");
        assert_eq!(agent.role, "miner");
        assert_eq!(agent.state, AgentState::Idle);
        assert!(agent.is_idle());
        assert!(agent.current_task.is_none());
    }

    #[test]
    fn test_state_transitions() {
        assert!(AgentState::Idle.can_transition_to(AgentState::Working));
        assert!(AgentState::Working.can_transition_to(AgentState::Idle));
        assert!(!AgentState::Offline.can_transition_to(AgentState::Idle));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Offline));
        assert!(!AgentState::Idle.can_transition_to(AgentState::Idle));
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Bridge.to_string(), "bridge");
        assert_eq!(Transport::Simulation.to_string(), "simulation");
    }

    #[test]
    fn test_completion_reason_serialization() {
        let json = serde_json::to_string(&CompletionReason::DispatchError).unwrap();
        assert_eq!(json, "\"dispatch_error\"");
    }

    #[test]
    fn test_metrics_default() {
        let metrics = DispatchMetrics::default();
        assert_eq!(metrics.submitted, 0);
        assert_eq!(metrics.timed_out, 0);
    }
}
