use chrono::{DateTime, Utc};
use colony_core::Position;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle of a collaboration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// Axis-aligned box of world positions, both corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkArea {
    pub start: Position,
    pub end: Position,
}

impl WorkArea {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Read a `workArea` object with `start` and `end` corners.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Work handed to one participant by a partitioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Position of the participant in the partition order.
    pub slot: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<WorkArea>,
    /// Strategy-specific fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl Assignment {
    pub fn slot(slot: usize) -> Self {
        Self {
            slot,
            area: None,
            details: Map::new(),
        }
    }

    pub fn with_area(mut self, area: WorkArea) -> Self {
        self.area = Some(area);
        self
    }
}

/// One agent taking part in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub agent_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Percent complete, 0..=100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<Assignment>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Participant {
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            capabilities: Vec::new(),
            progress: 0,
            assignment: None,
            metadata: Map::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// Input to [`CollaborationEngine::create_session`](crate::CollaborationEngine::create_session).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    #[serde(default)]
    pub plan: Option<Value>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// State of a collaboration session. Participants keep insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub plan: Option<Value>,
    pub participants: Vec<Participant>,
    pub assignments: BTreeMap<String, Assignment>,
    pub status: SessionStatus,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub(crate) fn new(request: NewSession) -> Self {
        let now = Utc::now();
        let mut session = Self {
            id: Uuid::new_v4(),
            plan: request.plan,
            participants: Vec::new(),
            assignments: BTreeMap::new(),
            status: SessionStatus::Active,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        for participant in request.participants {
            session.upsert(participant);
        }
        session
    }

    pub fn participant(&self, agent_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.agent_id == agent_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Mean participant progress; 0 with no participants.
    pub fn progress(&self) -> f64 {
        if self.participants.is_empty() {
            return 0.0;
        }
        let total: u32 = self.participants.iter().map(|p| u32::from(p.progress)).sum();
        f64::from(total) / self.participants.len() as f64
    }

    /// Work area from `metadata.workArea`, if present and well formed.
    pub fn work_area(&self) -> Option<WorkArea> {
        self.metadata.get("workArea").and_then(WorkArea::from_value)
    }

    /// Insert or replace by agent id. A replaced participant keeps its slot
    /// in the order but loses its assignment.
    pub(crate) fn upsert(&mut self, mut participant: Participant) {
        participant.progress = participant.progress.min(100);
        participant.assignment = None;
        self.assignments.remove(&participant.agent_id);
        match self
            .participants
            .iter_mut()
            .find(|p| p.agent_id == participant.agent_id)
        {
            Some(existing) => *existing = participant,
            None => self.participants.push(participant),
        }
        self.touch();
    }

    pub(crate) fn remove(&mut self, agent_id: &str) -> Option<Participant> {
        let index = self.participants.iter().position(|p| p.agent_id == agent_id)?;
        self.assignments.remove(agent_id);
        self.touch();
        Some(self.participants.remove(index))
    }

    /// Replace every assignment. Participants missing from `assignments` end up unassigned.
    pub(crate) fn assign(&mut self, assignments: BTreeMap<String, Assignment>) {
        for participant in &mut self.participants {
            participant.assignment = assignments.get(&participant.agent_id).cloned();
        }
        self.assignments = assignments
            .into_iter()
            .filter(|(id, _)| self.participants.iter().any(|p| &p.agent_id == id))
            .collect();
        self.touch();
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
