use crate::bridge::{Bridge, BridgeEvent, SimulationBridge};
use crate::config::SchedulerConfig;
use crate::events::{EventBus, SchedulerEvent};
use crate::registry::AgentRegistry;
use crate::task_queue::{QueueEntry, TaskQueue};
use crate::types::{
    Agent, CompletionReason, DispatchMetrics, QueuedTaskSummary, StatusSnapshot, TaskOutcome,
};
use async_trait::async_trait;
use chrono::Utc;
use colony_core::{
    ColonyError, ColonyResult, CompletionMap, Position, Task, TaskExecutor, TaskRequest,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a submitted task went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Handed straight to an idle agent.
    Assigned { agent_id: String, task_id: Uuid },
    /// Waiting in the queue at a 1-based `position`.
    Queued { task_id: Uuid, position: usize },
}

impl Submission {
    /// Id of the submitted task, wherever it went.
    pub fn task_id(&self) -> Uuid {
        match self {
            Submission::Assigned { task_id, .. } | Submission::Queued { task_id, .. } => *task_id,
        }
    }
}

struct DispatchState {
    registry: AgentRegistry,
    queue: TaskQueue,
    /// Armed safety timer per working agent, tagged with the task it guards.
    timers: HashMap<String, (Uuid, JoinHandle<()>)>,
    metrics: DispatchMetrics,
    shut_down: bool,
}

struct Inner {
    config: SchedulerConfig,
    bridge: Arc<dyn Bridge>,
    events: EventBus,
    state: Mutex<DispatchState>,
    waiters: CompletionMap<Uuid, TaskOutcome>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

/// Matches idle agents with tasks and drives every task to exactly one completion.
///
/// All queue and registry mutation happens under one lock that is never held
/// across an `.await`. Events for a task are emitted under that lock, so their
/// order is fixed.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Dispatcher backed by the simulation bridge.
    pub fn new(config: SchedulerConfig) -> Self {
        let bridge = Arc::new(SimulationBridge::new(config.simulation.clone()));
        Self::with_bridge(config, bridge)
    }

    /// Dispatcher driving agents through `bridge`.
    pub fn with_bridge(config: SchedulerConfig, bridge: Arc<dyn Bridge>) -> Self {
        let events = EventBus::new(config.event_capacity);
        let state = DispatchState {
            registry: AgentRegistry::new(config.default_spawn_position, events.clone()),
            queue: TaskQueue::new(config.max_queue_size, events.clone()),
            timers: HashMap::new(),
            metrics: DispatchMetrics::default(),
            shut_down: false,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                bridge,
                events,
                state: Mutex::new(state),
                waiters: CompletionMap::new(),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start consuming bridge events. Calling it again is a no-op.
    pub fn start(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let mut rx = self.inner.bridge.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        Dispatcher { inner }.handle_bridge_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Bridge event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Bridge event listener stopped");
        }));
        info!(bridge = %self.inner.bridge.name(), "Dispatcher started");
    }

    /// Receive every scheduler event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// The bus the dispatcher publishes on.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Settings the dispatcher was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // ---- agents ----

    /// Register (or re-register) an agent, then give it queued work.
    pub fn register_agent(&self, agent: Agent) -> ColonyResult<()> {
        let mut state = self.inner.state.lock();
        state.registry.register(agent)?;
        self.pump_locked(&mut state);
        Ok(())
    }

    /// Take an agent offline. Its in-flight task fails with reason `agent_unregistered`.
    pub fn unregister_agent(&self, agent_id: &str) -> ColonyResult<()> {
        let mut state = self.inner.state.lock();
        self.finish_locked(
            &mut state,
            agent_id,
            None,
            false,
            CompletionReason::AgentUnregistered,
            Some("agent unregistered".to_string()),
            Map::new(),
        );
        state.registry.unregister(agent_id)?;
        Ok(())
    }

    /// Copy of one registered agent.
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.inner.state.lock().registry.get(agent_id).cloned()
    }

    /// Every agent, in registration order.
    pub fn agents(&self) -> Vec<Agent> {
        self.inner
            .state
            .lock()
            .registry
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    // ---- submission ----

    /// Validate and route a task request.
    pub fn submit(&self, request: TaskRequest) -> ColonyResult<Submission> {
        let task = Task::admit(request).inspect_err(|e| {
            warn!(error = %e, "Task rejected at validation");
        })?;
        self.submit_task(task)
    }

    /// Route an admitted task: first idle agent whose role it accepts, else the queue.
    pub fn submit_task(&self, task: Task) -> ColonyResult<Submission> {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return Err(ColonyError::Cancelled("scheduler is shut down".to_string()));
        }
        state.metrics.submitted += 1;

        let candidate = state
            .registry
            .list_idle()
            .into_iter()
            .find(|a| task.accepts_role(&a.role))
            .map(|a| a.id.clone());

        if let Some(agent_id) = candidate {
            let task_id = task.id;
            self.assign_locked(&mut state, &agent_id, task)?;
            return Ok(Submission::Assigned { agent_id, task_id });
        }

        match state.queue.enqueue(task.clone()) {
            Ok(enqueued) => {
                state.metrics.queued += 1;
                if let Some(evicted) = enqueued.evicted {
                    state.metrics.dropped += 1;
                    self.inner.waiters.resolve(
                        &evicted.id,
                        Err(ColonyError::Cancelled(format!(
                            "task {} evicted by higher-priority task {}",
                            evicted.id, task.id
                        ))),
                    );
                }
                info!(
                    task_id = %task.id,
                    action = %task.action,
                    position = enqueued.position,
                    "Task queued"
                );
                let task_id = task.id;
                self.inner.events.emit(SchedulerEvent::TaskQueued {
                    task,
                    position: enqueued.position,
                });
                Ok(Submission::Queued {
                    task_id,
                    position: enqueued.position,
                })
            }
            Err(e) => {
                state.metrics.rejected += 1;
                Err(e)
            }
        }
    }

    /// Submit and wait for the task's completion, or fail after `timeout`.
    pub async fn submit_and_wait(
        &self,
        request: TaskRequest,
        timeout: Duration,
    ) -> ColonyResult<TaskOutcome> {
        let task = Task::admit(request)?;
        let task_id = task.id;
        let handle = self.inner.waiters.register(task_id, timeout, move || {
            ColonyError::TaskTimeout {
                agent_id: "dispatcher".to_string(),
                task_id: task_id.to_string(),
            }
        });
        if let Err(e) = self.submit_task(task) {
            self.inner.waiters.resolve(&task_id, Err(e.clone()));
            return Err(e);
        }
        handle.wait().await
    }

    // ---- completion ----

    /// Complete the agent's current task. Returns `false` if it had none.
    ///
    /// Idempotent: a second call for the same task changes nothing.
    pub fn complete(&self, agent_id: &str, success: bool, metadata: Map<String, Value>) -> bool {
        let mut state = self.inner.state.lock();
        let reason = if success {
            CompletionReason::Completed
        } else {
            CompletionReason::Failed
        };
        let done = self.finish_locked(&mut state, agent_id, None, success, reason, None, metadata);
        if done {
            self.pump_locked(&mut state);
        }
        done
    }

    /// Apply one bridge event. Events for unknown agents, idle agents, or a
    /// different task than the current one are ignored.
    pub fn handle_bridge_event(&self, event: BridgeEvent) {
        let mut state = self.inner.state.lock();
        match event {
            BridgeEvent::AgentSpawned { agent_id, position } => {
                let position = position.unwrap_or(self.inner.config.default_spawn_position);
                if state.registry.set_position(&agent_id, position).is_ok() {
                    self.inner
                        .events
                        .emit(SchedulerEvent::AgentSpawned { agent_id, position });
                } else {
                    debug!(agent_id = %agent_id, "Spawn event for unknown agent ignored");
                }
            }
            BridgeEvent::AgentStatus {
                agent_id,
                task_id,
                progress,
                status,
                success,
            } => {
                let mut metadata = Map::new();
                if let Some(status) = status.clone() {
                    metadata.insert("status".to_string(), Value::String(status));
                }
                self.apply_feedback_locked(
                    &mut state, &agent_id, task_id, progress, success, status, metadata,
                );
            }
            BridgeEvent::TaskFeedback {
                agent_id,
                task_id,
                progress,
                success,
                message,
            } => {
                let mut metadata = Map::new();
                if let Some(message) = message.clone() {
                    metadata.insert("message".to_string(), Value::String(message));
                }
                self.apply_feedback_locked(
                    &mut state, &agent_id, task_id, progress, success, message, metadata,
                );
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_feedback_locked(
        &self,
        state: &mut DispatchState,
        agent_id: &str,
        task_id: Option<Uuid>,
        progress: Option<i64>,
        success: Option<bool>,
        message: Option<String>,
        metadata: Map<String, Value>,
    ) {
        let Some(current) = current_task_id(state, agent_id) else {
            debug!(agent_id, "Feedback for agent without a task ignored");
            return;
        };
        if task_id.is_some_and(|id| id != current) {
            debug!(agent_id, task_id = ?task_id, "Feedback for stale task ignored");
            return;
        }

        if let Some(progress) = progress {
            if let Ok(progress) = state.registry.update_progress(agent_id, progress) {
                self.inner.events.emit(SchedulerEvent::TaskProgress {
                    agent_id: agent_id.to_string(),
                    task_id: current,
                    progress,
                    message: message.clone(),
                });
            }
        }

        if let Some(success) = success {
            let (reason, error) = if success {
                (CompletionReason::Completed, None)
            } else {
                (
                    CompletionReason::Failed,
                    Some(message.unwrap_or_else(|| "bridge reported failure".to_string())),
                )
            };
            if self.finish_locked(state, agent_id, Some(current), success, reason, error, metadata)
            {
                self.pump_locked(state);
            }
        }
    }

    fn on_dispatch_result(&self, agent_id: &str, task_id: Uuid, result: ColonyResult<()>) {
        let mut state = self.inner.state.lock();
        let awaiting = state
            .registry
            .get(agent_id)
            .is_some_and(|a| a.awaiting_feedback);
        let done = match result {
            Ok(()) if awaiting => false,
            Ok(()) => self.finish_locked(
                &mut state,
                agent_id,
                Some(task_id),
                true,
                CompletionReason::Completed,
                None,
                Map::new(),
            ),
            Err(e) => {
                warn!(agent_id, task_id = %task_id, error = %e, "Dispatch failed");
                self.finish_locked(
                    &mut state,
                    agent_id,
                    Some(task_id),
                    false,
                    CompletionReason::DispatchError,
                    Some(e.to_string()),
                    Map::new(),
                )
            }
        };
        if done {
            self.pump_locked(&mut state);
        }
    }

    fn on_timeout(&self, agent_id: &str, task_id: Uuid) {
        let mut state = self.inner.state.lock();
        let armed = state
            .timers
            .get(agent_id)
            .is_some_and(|(armed, _)| *armed == task_id);
        if !armed {
            return;
        }
        warn!(agent_id, task_id = %task_id, "Task timed out");
        let err = ColonyError::TaskTimeout {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
        };
        if self.finish_locked(
            &mut state,
            agent_id,
            Some(task_id),
            false,
            CompletionReason::Timeout,
            Some(err.to_string()),
            Map::new(),
        ) {
            self.pump_locked(&mut state);
        }
    }

    // ---- internals (state lock held) ----

    fn assign_locked(
        &self,
        state: &mut DispatchState,
        agent_id: &str,
        task: Task,
    ) -> ColonyResult<()> {
        let bridge = &self.inner.bridge;
        let awaiting_feedback = self.inner.config.require_feedback
            && bridge.is_connected()
            && bridge.supports_feedback();
        state
            .registry
            .assign(agent_id, task.clone(), awaiting_feedback)?;
        state.metrics.assigned += 1;

        let deadline = self.inner.config.timeout_for(task.action);
        let timer = {
            let this = self.clone();
            let agent_id = agent_id.to_string();
            let task_id = task.id;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                this.on_timeout(&agent_id, task_id);
            })
        };
        if let Some((_, stale)) = state
            .timers
            .insert(agent_id.to_string(), (task.id, timer))
        {
            stale.abort();
        }

        info!(
            agent_id,
            task_id = %task.id,
            action = %task.action,
            awaiting_feedback,
            "Task assigned"
        );
        self.inner.events.emit(SchedulerEvent::TaskAssigned {
            agent_id: agent_id.to_string(),
            task: task.clone(),
        });
        self.inner.events.emit(SchedulerEvent::TaskDispatched {
            agent_id: agent_id.to_string(),
            task_id: task.id,
            transport: bridge.transport(),
        });

        let this = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            let result = this
                .inner
                .bridge
                .dispatch(&task, &agent_id)
                .await
                .map(|receipt| {
                    debug!(agent_id = %agent_id, message = ?receipt.message, "Dispatch acknowledged");
                });
            this.on_dispatch_result(&agent_id, task.id, result);
        });
        Ok(())
    }

    /// Release the agent's current task and emit its single `task_completed`.
    ///
    /// With `expected` set, only completes if the current task has that id.
    /// Does not pump the queue.
    #[allow(clippy::too_many_arguments)]
    fn finish_locked(
        &self,
        state: &mut DispatchState,
        agent_id: &str,
        expected: Option<Uuid>,
        success: bool,
        reason: CompletionReason,
        error: Option<String>,
        metadata: Map<String, Value>,
    ) -> bool {
        let Some(current) = current_task_id(state, agent_id) else {
            return false;
        };
        if expected.is_some_and(|id| id != current) {
            return false;
        }
        if let Some((_, timer)) = state.timers.remove(agent_id) {
            timer.abort();
        }
        let task = match state.registry.release(agent_id) {
            Ok(task) => task,
            Err(e) => {
                error!(agent_id, error = %e, "Failed to release agent");
                return false;
            }
        };

        if success {
            state.metrics.completed += 1;
        } else {
            state.metrics.failed += 1;
        }
        if reason == CompletionReason::Timeout {
            state.metrics.timed_out += 1;
        }

        info!(agent_id, task_id = %task.id, success, reason = ?reason, "Task completed");
        let outcome = TaskOutcome {
            task_id: task.id,
            agent_id: agent_id.to_string(),
            success,
            reason,
            error: error.clone(),
        };
        self.inner.events.emit(SchedulerEvent::TaskCompleted {
            agent_id: agent_id.to_string(),
            task,
            success,
            reason,
            error,
            metadata,
        });
        let task_id = outcome.task_id;
        self.inner.waiters.resolve(&task_id, Ok(outcome));
        true
    }

    /// Hand queued tasks to idle agents until either runs out.
    fn pump_locked(&self, state: &mut DispatchState) {
        if state.shut_down {
            return;
        }
        loop {
            if state.queue.is_empty() {
                break;
            }
            let idle: Vec<(String, String)> = state
                .registry
                .list_idle()
                .into_iter()
                .map(|a| (a.id.clone(), a.role.clone()))
                .collect();
            if idle.is_empty() {
                break;
            }
            let roles: Vec<String> = idle.iter().map(|(_, role)| role.clone()).collect();

            let pick = idle.iter().find_map(|(agent_id, role)| {
                state
                    .queue
                    .select_for(role, &roles)
                    .map(|task_id| (agent_id.clone(), task_id))
            });
            let Some((agent_id, task_id)) = pick else {
                break;
            };
            let Some(task) = state.queue.remove(task_id) else {
                break;
            };
            if let Err(e) = self.assign_locked(state, &agent_id, task) {
                error!(agent_id = %agent_id, task_id = %task_id, error = %e, "Assignment from queue failed");
                break;
            }
        }
    }

    // ---- queries ----

    /// Number of tasks waiting for an agent.
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Queued tasks, head first.
    pub fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.state.lock().queue.snapshot()
    }

    /// Counters since construction.
    pub fn metrics(&self) -> DispatchMetrics {
        self.inner.state.lock().metrics.clone()
    }

    /// Whether any agent currently holds a task.
    pub fn has_working_agents(&self) -> bool {
        self.inner.state.lock().registry.has_working()
    }

    /// Any agent working or any task queued.
    pub fn is_busy(&self) -> bool {
        let state = self.inner.state.lock();
        state.registry.has_working() || !state.queue.is_empty()
    }

    /// Point-in-time view of the dispatcher, taken under one lock.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let state = self.inner.state.lock();
        StatusSnapshot {
            agents: state.registry.snapshot(),
            queue_depth: state.queue.len(),
            queued: state
                .queue
                .snapshot()
                .into_iter()
                .map(|e| QueuedTaskSummary {
                    task_id: e.task.id,
                    action: e.task.action,
                    priority: e.task.priority,
                    details: e.task.details,
                })
                .collect(),
            metrics: state.metrics.clone(),
            generated_at: Utc::now(),
        }
    }

    /// Where new agents appear when a request names no position.
    pub fn default_spawn_position(&self) -> Position {
        self.inner.config.default_spawn_position
    }

    // ---- shutdown ----

    /// Cancel every timer, fail in-flight tasks, drop queued ones, and close the bridge.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;

            let working: Vec<String> = state
                .registry
                .list()
                .into_iter()
                .filter(|a| a.current_task.is_some())
                .map(|a| a.id.clone())
                .collect();
            for agent_id in working {
                self.finish_locked(
                    &mut state,
                    &agent_id,
                    None,
                    false,
                    CompletionReason::Shutdown,
                    Some("scheduler shut down".to_string()),
                    Map::new(),
                );
            }
            for (_, (_, timer)) in state.timers.drain() {
                timer.abort();
            }
            for task in state.queue.drain() {
                state.metrics.dropped += 1;
                self.inner.waiters.resolve(
                    &task.id,
                    Err(ColonyError::Cancelled("scheduler shut down".to_string())),
                );
                self.inner.events.emit(SchedulerEvent::TaskDropped {
                    task,
                    reason: "scheduler shut down".to_string(),
                });
            }
        }

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.waiters.cancel_all();
        self.inner.bridge.close().await;
        info!("Dispatcher shut down");
    }
}

fn current_task_id(state: &DispatchState, agent_id: &str) -> Option<Uuid> {
    state
        .registry
        .get(agent_id)
        .and_then(|a| a.current_task.as_ref())
        .map(|t| t.id)
}

/// Serves tasks delegated by peers: runs them locally and waits for the outcome.
#[async_trait]
impl TaskExecutor for Dispatcher {
    async fn execute(&self, request: TaskRequest) -> ColonyResult<Value> {
        let action = colony_core::TaskAction::parse(&request.action);
        // Queue wait plus execution.
        let timeout = action
            .map(|a| self.inner.config.timeout_for(a))
            .unwrap_or(Duration::from_millis(self.inner.config.task_timeout_ms))
            .saturating_mul(2);
        let outcome = self.submit_and_wait(request, timeout).await?;
        if outcome.success {
            Ok(serde_json::to_value(&outcome)?)
        } else {
            Err(ColonyError::DispatchFailed {
                cause: outcome
                    .error
                    .unwrap_or_else(|| format!("task {} failed", outcome.task_id)),
            })
        }
    }
}
