use crate::events::{EventBus, SchedulerEvent};
use crate::types::{Agent, AgentSnapshot, AgentState};
use chrono::Utc;
use colony_core::{ColonyError, ColonyResult, Position, Task};
use std::collections::HashMap;
use tracing::{debug, info};

/// Lifecycle state of every agent, in registration order.
///
/// Only idle <-> working transitions are allowed through [`set_state`](Self::set_state);
/// offline is entered by [`unregister`](Self::unregister) and left by re-registering.
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
    order: Vec<String>,
    default_spawn_position: Position,
    events: EventBus,
}

impl AgentRegistry {
    pub fn new(default_spawn_position: Position, events: EventBus) -> Self {
        Self {
            agents: HashMap::new(),
            order: Vec::new(),
            default_spawn_position,
            events,
        }
    }

    /// Register an agent, or bring an offline one back as idle.
    ///
    /// Re-registering an idle agent updates its role and position. A working
    /// agent cannot be re-registered.
    pub fn register(&mut self, mut agent: Agent) -> ColonyResult<()> {
        if agent.id.trim().is_empty() {
            return Err(ColonyError::Config("agent id must be non-empty".to_string()));
        }
        if let Some(existing) = self.agents.get(&agent.id) {
            if existing.state == AgentState::Working {
                return Err(ColonyError::Conflict(format!(
                    "agent '{}' is working and cannot be re-registered",
                    agent.id
                )));
            }
            if agent.position.is_none() {
                agent.position = existing.position;
            }
        } else {
            self.order.push(agent.id.clone());
        }

        agent.state = AgentState::Idle;
        agent.current_task = None;
        agent.progress = 0;
        agent.awaiting_feedback = false;
        agent.position = agent.position.or(Some(self.default_spawn_position));
        agent.last_update = Utc::now();

        info!(agent_id = %agent.id, role = %agent.role, "Agent registered");
        self.events.emit(SchedulerEvent::AgentRegistered {
            agent_id: agent.id.clone(),
            role: agent.role.clone(),
        });
        self.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    /// Take an agent offline. Returns the task it was working on, if any.
    pub fn unregister(&mut self, id: &str) -> ColonyResult<Option<Task>> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| ColonyError::NotFound(format!("agent '{id}'")))?;
        if agent.state == AgentState::Offline {
            return Ok(None);
        }
        let task = agent.current_task.take();
        agent.state = AgentState::Offline;
        agent.progress = 0;
        agent.awaiting_feedback = false;
        agent.last_update = Utc::now();

        info!(agent_id = %id, "Agent unregistered");
        self.events.emit(SchedulerEvent::AgentUnregistered {
            agent_id: id.to_string(),
        });
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Agents with `state == Idle` and no task, in registration order.
    pub fn list_idle(&self) -> Vec<&Agent> {
        self.iter().filter(|a| a.is_idle()).collect()
    }

    /// Every agent, in registration order.
    pub fn list(&self) -> Vec<&Agent> {
        self.iter().collect()
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.iter().map(AgentSnapshot::from).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn has_working(&self) -> bool {
        self.agents.values().any(|a| a.state == AgentState::Working)
    }

    /// Validated idle <-> working transition.
    pub fn set_state(&mut self, id: &str, state: AgentState) -> ColonyResult<()> {
        let agent = self.get_mut(id)?;
        if !agent.state.can_transition_to(state) {
            return Err(ColonyError::Conflict(format!(
                "agent '{id}' cannot go from {} to {state}",
                agent.state
            )));
        }
        agent.state = state;
        agent.last_update = Utc::now();
        Ok(())
    }

    /// Move an idle agent to working on `task`.
    pub fn assign(&mut self, id: &str, task: Task, awaiting_feedback: bool) -> ColonyResult<()> {
        self.set_state(id, AgentState::Working)?;
        let agent = self.get_mut(id)?;
        agent.current_task = Some(task);
        agent.progress = 0;
        agent.awaiting_feedback = awaiting_feedback;
        Ok(())
    }

    /// Return a working agent to idle, yielding its task.
    pub fn release(&mut self, id: &str) -> ColonyResult<Task> {
        let task = self
            .get_mut(id)?
            .current_task
            .clone()
            .ok_or_else(|| ColonyError::Conflict(format!("agent '{id}' has no current task")))?;
        self.set_state(id, AgentState::Idle)?;
        let agent = self.get_mut(id)?;
        agent.current_task = None;
        agent.progress = 0;
        agent.awaiting_feedback = false;
        Ok(task)
    }

    /// Record progress, clamped to `0..=100`. Returns the stored value.
    pub fn update_progress(&mut self, id: &str, progress: i64) -> ColonyResult<u8> {
        let agent = self.get_mut(id)?;
        let clamped = progress.clamp(0, 100) as u8;
        agent.progress = clamped;
        agent.last_update = Utc::now();
        debug!(agent_id = %id, progress = clamped, "Agent progress");
        Ok(clamped)
    }

    pub fn set_position(&mut self, id: &str, position: Position) -> ColonyResult<()> {
        let agent = self.get_mut(id)?;
        agent.position = Some(position);
        agent.last_update = Utc::now();
        Ok(())
    }

    fn get_mut(&mut self, id: &str) -> ColonyResult<&mut Agent> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| ColonyError::NotFound(format!("agent '{id}'")))
    }

    fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.order.iter().filter_map(|id| self.agents.get(id))
    }
}
