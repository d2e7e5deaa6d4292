use crate::config::SimulationConfig;
use crate::types::Transport;
use async_trait::async_trait;
use colony_core::{ColonyError, ColonyResult, Position, Task};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Events a bridge reports back about agents in the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    AgentSpawned {
        agent_id: String,
        position: Option<Position>,
    },
    AgentStatus {
        agent_id: String,
        #[serde(default)]
        task_id: Option<Uuid>,
        #[serde(default)]
        progress: Option<i64>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        success: Option<bool>,
    },
    TaskFeedback {
        agent_id: String,
        #[serde(default)]
        task_id: Option<Uuid>,
        #[serde(default)]
        progress: Option<i64>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl BridgeEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            BridgeEvent::AgentSpawned { agent_id, .. }
            | BridgeEvent::AgentStatus { agent_id, .. }
            | BridgeEvent::TaskFeedback { agent_id, .. } => agent_id,
        }
    }
}

/// Acknowledgement returned by a successful dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub message: Option<String>,
}

/// Actuation layer that turns a dispatched task into effects in the world.
///
/// The scheduler only pushes through [`dispatch`](Bridge::dispatch); everything
/// else flows back as [`BridgeEvent`]s.
#[async_trait]
pub trait Bridge: Send + Sync {
    fn name(&self) -> &str;

    fn transport(&self) -> Transport;

    fn is_connected(&self) -> bool;

    /// Whether this bridge reports task completion through feedback events.
    fn supports_feedback(&self) -> bool;

    async fn dispatch(&self, task: &Task, agent_id: &str) -> ColonyResult<DispatchReceipt>;

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;

    async fn close(&self);
}

/// Stand-in bridge used when no world is attached.
///
/// `dispatch` resolves after a simulated duration: one step per
/// `metadata.plan` entry, or a fixed default without a plan. Intermediate
/// progress is reported as feedback without a success flag.
pub struct SimulationBridge {
    config: SimulationConfig,
    tx: broadcast::Sender<BridgeEvent>,
    closed: AtomicBool,
}

impl SimulationBridge {
    pub fn new(config: SimulationConfig) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            config,
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Total simulated duration for a task.
    pub fn duration_for(&self, task: &Task) -> Duration {
        match task.plan_len() {
            Some(steps) if steps > 0 => {
                Duration::from_millis(self.config.step_duration_ms.saturating_mul(steps as u64))
            }
            _ => Duration::from_millis(self.config.default_duration_ms),
        }
    }
}

impl Default for SimulationBridge {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

#[async_trait]
impl Bridge for SimulationBridge {
    fn name(&self) -> &str {
        "simulation"
    }

    fn transport(&self) -> Transport {
        Transport::Simulation
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn supports_feedback(&self) -> bool {
        false
    }

    async fn dispatch(&self, task: &Task, agent_id: &str) -> ColonyResult<DispatchReceipt> {
        if !self.is_connected() {
            return Err(ColonyError::DispatchFailed {
                cause: "simulation bridge closed".to_string(),
            });
        }

        let steps = task.plan_len().filter(|n| *n > 0).unwrap_or(1);
        let step = self.duration_for(task) / steps as u32;
        debug!(agent_id, task_id = %task.id, steps, "Simulating task");

        for done in 1..=steps {
            tokio::time::sleep(step).await;
            if done < steps {
                let _ = self.tx.send(BridgeEvent::TaskFeedback {
                    agent_id: agent_id.to_string(),
                    task_id: Some(task.id),
                    progress: Some((done * 100 / steps) as i64),
                    success: None,
                    message: None,
                });
            }
        }

        Ok(DispatchReceipt {
            message: Some(format!("simulated {} in {steps} step(s)", task.action)),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
