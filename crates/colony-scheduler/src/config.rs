use colony_core::{ColonyError, ColonyResult, Position, TaskAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Smallest autonomy interval accepted.
pub const MIN_AUTONOMY_INTERVAL_MS: u64 = 1000;
/// Upper bound on tasks the oracle may contribute per cycle.
pub const MAX_AUTONOMY_TASKS: usize = 10;

const DEFAULT_INSTRUCTIONS: &str = "You coordinate a team of autonomous agents. Given the \
status snapshot, propose up to the allowed number of useful tasks for idle agents. Reply \
with a JSON object {\"tasks\": [...], \"rationale\": \"...\"} where each task has action, \
details, optional target, metadata and priority.";

/// Dispatcher and queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Per-action override of `task_timeout_ms`, keyed by action tag.
    #[serde(default)]
    pub action_timeouts_ms: HashMap<String, u64>,
    /// Keep agents working until the bridge reports feedback.
    #[serde(default)]
    pub require_feedback: bool,
    #[serde(default)]
    pub default_spawn_position: Position,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            task_timeout_ms: default_task_timeout_ms(),
            action_timeouts_ms: HashMap::new(),
            require_feedback: false,
            default_spawn_position: Position::default(),
            event_capacity: default_event_capacity(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Safety timeout for a task of the given action.
    pub fn timeout_for(&self, action: TaskAction) -> Duration {
        let ms = self
            .action_timeouts_ms
            .get(action.as_str())
            .copied()
            .unwrap_or(self.task_timeout_ms);
        Duration::from_millis(ms)
    }

    /// Reject a zero-capacity queue and timeout overrides for unknown actions.
    pub fn validate(&self) -> ColonyResult<()> {
        if self.max_queue_size == 0 {
            return Err(ColonyError::Config(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        if let Some(key) = self
            .action_timeouts_ms
            .keys()
            .find(|k| TaskAction::parse(k).is_none())
        {
            return Err(ColonyError::Config(format!(
                "action_timeouts_ms has unknown action '{key}'"
            )));
        }
        Ok(())
    }
}

/// Timing of the simulation bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Simulated time per `metadata.plan` step.
    #[serde(default = "default_step_duration_ms")]
    pub step_duration_ms: u64,
    /// Simulated time for a task without a plan.
    #[serde(default = "default_duration_ms")]
    pub default_duration_ms: u64,
}

fn default_step_duration_ms() -> u64 {
    1000
}

fn default_duration_ms() -> u64 {
    3000
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            step_duration_ms: default_step_duration_ms(),
            default_duration_ms: default_duration_ms(),
        }
    }
}

/// Autonomy controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default)]
    pub allow_when_busy: bool,
    #[serde(default = "default_sender")]
    pub sender: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    /// Canned oracle reply; when set, a mock oracle is used.
    #[serde(default)]
    pub mock_response: Option<Value>,
    #[serde(default = "default_oracle_timeout_ms")]
    pub oracle_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_max_tasks() -> usize {
    3
}

fn default_sender() -> String {
    "autonomy".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_instructions() -> String {
    DEFAULT_INSTRUCTIONS.to_string()
}

fn default_oracle_timeout_ms() -> u64 {
    30_000
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_interval_ms(),
            max_tasks: default_max_tasks(),
            allow_when_busy: false,
            sender: default_sender(),
            temperature: default_temperature(),
            instructions: default_instructions(),
            mock_response: None,
            oracle_timeout_ms: default_oracle_timeout_ms(),
        }
    }
}

impl AutonomyConfig {
    /// Clamp the interval to at least one second and `max_tasks` to `1..=10`.
    pub fn normalized(mut self) -> Self {
        self.interval_ms = self.interval_ms.max(MIN_AUTONOMY_INTERVAL_MS);
        self.max_tasks = self.max_tasks.clamp(1, MAX_AUTONOMY_TASKS);
        if self.sender.trim().is_empty() {
            self.sender = default_sender();
        }
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}
