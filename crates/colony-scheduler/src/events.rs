use crate::types::{CompletionReason, Transport};
use colony_core::{Position, Task};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Everything the scheduler reports about agents and tasks.
///
/// For a single task the order is always
/// `task_queued? -> task_assigned -> task_dispatched -> task_progress* -> task_completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    AgentRegistered {
        agent_id: String,
        role: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    AgentSpawned {
        agent_id: String,
        position: Position,
    },
    TaskQueued {
        task: Task,
        position: usize,
    },
    /// A queued task was evicted by a higher-priority arrival.
    TaskDropped {
        task: Task,
        reason: String,
    },
    /// A task was refused at a full queue.
    TaskRejected {
        task: Task,
        reason: String,
    },
    TaskAssigned {
        agent_id: String,
        task: Task,
    },
    TaskDispatched {
        agent_id: String,
        task_id: Uuid,
        transport: Transport,
    },
    TaskProgress {
        agent_id: String,
        task_id: Uuid,
        progress: u8,
        message: Option<String>,
    },
    TaskCompleted {
        agent_id: String,
        task: Task,
        success: bool,
        reason: CompletionReason,
        error: Option<String>,
        metadata: Map<String, Value>,
    },
    AutonomyCycle {
        created: usize,
        dropped: usize,
        rationale: Option<String>,
    },
}

impl SchedulerEvent {
    /// Wire name of the event, e.g. `task_completed`.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::AgentRegistered { .. } => "agent_registered",
            SchedulerEvent::AgentUnregistered { .. } => "agent_unregistered",
            SchedulerEvent::AgentSpawned { .. } => "agent_spawned",
            SchedulerEvent::TaskQueued { .. } => "task_queued",
            SchedulerEvent::TaskDropped { .. } => "task_dropped",
            SchedulerEvent::TaskRejected { .. } => "task_rejected",
            SchedulerEvent::TaskAssigned { .. } => "task_assigned",
            SchedulerEvent::TaskDispatched { .. } => "task_dispatched",
            SchedulerEvent::TaskProgress { .. } => "task_progress",
            SchedulerEvent::TaskCompleted { .. } => "task_completed",
            SchedulerEvent::AutonomyCycle { .. } => "autonomy_cycle",
        }
    }

    /// Id of the task this event concerns, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            SchedulerEvent::TaskQueued { task, .. }
            | SchedulerEvent::TaskDropped { task, .. }
            | SchedulerEvent::TaskRejected { task, .. }
            | SchedulerEvent::TaskAssigned { task, .. }
            | SchedulerEvent::TaskCompleted { task, .. } => Some(task.id),
            SchedulerEvent::TaskDispatched { task_id, .. }
            | SchedulerEvent::TaskProgress { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

/// Broadcast fan-out of [`SchedulerEvent`]s. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
