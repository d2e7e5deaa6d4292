use crate::partition::{Partitioner, SpatialPartitioner};
use crate::session::{Assignment, NewSession, Participant, SessionSnapshot, SessionStatus};
use colony_core::{collab_events, ClusterBroadcast, ColonyError, ColonyResult};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Local notifications from the collaboration engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CollabEvent {
    SessionCreated {
        session: SessionSnapshot,
    },
    ParticipantAdded {
        session_id: Uuid,
        participant: Participant,
    },
    ParticipantRemoved {
        session_id: Uuid,
        agent_id: String,
    },
    AssignmentsUpdated {
        session_id: Uuid,
        partitioner: String,
        assignments: BTreeMap<String, Assignment>,
    },
    ProgressUpdated {
        session_id: Uuid,
        agent_id: String,
        progress: u8,
        session_progress: f64,
    },
    SessionCompleted {
        session_id: Uuid,
    },
    /// A `collab_*` event from another node. Never applied to local sessions.
    RemoteObserved {
        event_type: String,
        from: Option<String>,
        data: Value,
    },
}

struct SessionEntry {
    snapshot: SessionSnapshot,
    partitioner: Option<Arc<dyn Partitioner>>,
}

/// Owns the collaboration sessions of one node.
///
/// Every mutation is mirrored to peers through the [`ClusterBroadcast`] as a
/// `collab_*` event and to local subscribers as a [`CollabEvent`].
pub struct CollaborationEngine {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    partitioner: Arc<dyn Partitioner>,
    cluster: Option<Arc<dyn ClusterBroadcast>>,
    events: broadcast::Sender<CollabEvent>,
}

impl CollaborationEngine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            partitioner: Arc::new(SpatialPartitioner),
            cluster: None,
            events,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterBroadcast>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replace the default partitioner for every session without an override.
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    pub fn create_session(&self, request: NewSession) -> SessionSnapshot {
        let snapshot = SessionSnapshot::new(request);
        self.sessions.write().insert(
            snapshot.id,
            SessionEntry {
                snapshot: snapshot.clone(),
                partitioner: None,
            },
        );
        info!(
            session_id = %snapshot.id,
            participants = snapshot.participants.len(),
            "Collaboration session created"
        );

        self.broadcast(
            collab_events::SESSION_CREATED,
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
        self.emit(CollabEvent::SessionCreated {
            session: snapshot.clone(),
        });
        snapshot
    }

    pub fn get(&self, session_id: Uuid) -> Option<SessionSnapshot> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|e| e.snapshot.clone())
    }

    /// All sessions, oldest first. Completed sessions stay until the process exits.
    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .read()
            .values()
            .map(|e| e.snapshot.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Add a participant, replacing any with the same agent id.
    pub fn add_participant(
        &self,
        session_id: Uuid,
        participant: Participant,
    ) -> ColonyResult<SessionSnapshot> {
        let snapshot = self.mutate(session_id, |session| {
            session.upsert(participant.clone());
            Ok(())
        })?;
        debug!(session_id = %session_id, agent_id = %participant.agent_id, "Participant added");

        self.broadcast(
            collab_events::PARTICIPANT_ADDED,
            json!({"sessionId": session_id, "participant": participant}),
        );
        self.emit(CollabEvent::ParticipantAdded {
            session_id,
            participant,
        });
        Ok(snapshot)
    }

    /// Remove a participant and its assignment. `Ok(None)` if it was not in the session.
    pub fn remove_participant(
        &self,
        session_id: Uuid,
        agent_id: &str,
    ) -> ColonyResult<Option<Participant>> {
        let mut removed = None;
        self.mutate(session_id, |session| {
            removed = session.remove(agent_id);
            Ok(())
        })?;
        if removed.is_some() {
            debug!(session_id = %session_id, agent_id, "Participant removed");
            self.broadcast(
                collab_events::PARTICIPANT_REMOVED,
                json!({"sessionId": session_id, "agentId": agent_id}),
            );
            self.emit(CollabEvent::ParticipantRemoved {
                session_id,
                agent_id: agent_id.to_string(),
            });
        }
        Ok(removed)
    }

    /// Use `partitioner` for this session instead of the engine default.
    pub fn set_session_partitioner(
        &self,
        session_id: Uuid,
        partitioner: Arc<dyn Partitioner>,
    ) -> ColonyResult<()> {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found(session_id))?;
        entry.partitioner = Some(partitioner);
        Ok(())
    }

    /// Run the session's partitioner and overwrite every assignment.
    pub fn allocate_work(
        &self,
        session_id: Uuid,
        options: &Map<String, Value>,
    ) -> ColonyResult<BTreeMap<String, Assignment>> {
        let (assignments, strategy) = {
            let mut sessions = self.sessions.write();
            let entry = sessions
                .get_mut(&session_id)
                .ok_or_else(|| not_found(session_id))?;
            ensure_active(&entry.snapshot)?;
            let partitioner = entry
                .partitioner
                .clone()
                .unwrap_or_else(|| self.partitioner.clone());
            let assignments = partitioner.partition(&entry.snapshot, options);
            entry.snapshot.assign(assignments);
            (
                entry.snapshot.assignments.clone(),
                partitioner.name().to_string(),
            )
        };
        info!(
            session_id = %session_id,
            partitioner = %strategy,
            assigned = assignments.len(),
            "Work allocated"
        );

        self.broadcast(
            collab_events::ASSIGNMENTS_UPDATED,
            json!({"sessionId": session_id, "assignments": assignments}),
        );
        self.emit(CollabEvent::AssignmentsUpdated {
            session_id,
            partitioner: strategy,
            assignments: assignments.clone(),
        });
        Ok(assignments)
    }

    /// Record a participant's progress, clamped to 0..=100, and merge `metadata`
    /// into the participant's. Returns the stored progress.
    pub fn update_progress(
        &self,
        session_id: Uuid,
        agent_id: &str,
        progress: i64,
        metadata: Option<Map<String, Value>>,
    ) -> ColonyResult<u8> {
        let clamped = progress.clamp(0, 100) as u8;
        let merged = metadata.clone().unwrap_or_default();
        let snapshot = self.mutate(session_id, |session| {
            let participant = session
                .participants
                .iter_mut()
                .find(|p| p.agent_id == agent_id)
                .ok_or_else(|| {
                    ColonyError::NotFound(format!("participant {agent_id} in session {session_id}"))
                })?;
            participant.progress = clamped;
            participant.metadata.extend(merged);
            Ok(())
        })?;

        self.broadcast(
            collab_events::PROGRESS_UPDATED,
            json!({
                "sessionId": session_id,
                "agentId": agent_id,
                "progress": clamped,
                "metadata": metadata.unwrap_or_default(),
            }),
        );
        self.emit(CollabEvent::ProgressUpdated {
            session_id,
            agent_id: agent_id.to_string(),
            progress: clamped,
            session_progress: snapshot.progress(),
        });
        Ok(clamped)
    }

    /// Mark the session completed. Completing twice is a no-op.
    pub fn complete_session(
        &self,
        session_id: Uuid,
        metadata: Option<Map<String, Value>>,
    ) -> ColonyResult<SessionSnapshot> {
        let (snapshot, changed) = {
            let mut sessions = self.sessions.write();
            let entry = sessions
                .get_mut(&session_id)
                .ok_or_else(|| not_found(session_id))?;
            let changed = entry.snapshot.is_active();
            if changed {
                entry.snapshot.status = SessionStatus::Completed;
                entry.snapshot.metadata.extend(metadata.clone().unwrap_or_default());
                entry.snapshot.touch();
            }
            (entry.snapshot.clone(), changed)
        };
        if !changed {
            return Ok(snapshot);
        }
        info!(session_id = %session_id, progress = snapshot.progress(), "Collaboration session completed");

        self.broadcast(
            collab_events::SESSION_COMPLETED,
            json!({"sessionId": session_id, "metadata": metadata.unwrap_or_default()}),
        );
        self.emit(CollabEvent::SessionCompleted { session_id });
        Ok(snapshot)
    }

    /// Note a collaboration event received from a peer.
    pub fn observe_remote(&self, event_type: &str, from: Option<String>, data: Value) {
        debug!(event_type, from = ?from, "Remote collaboration event observed");
        self.emit(CollabEvent::RemoteObserved {
            event_type: event_type.to_string(),
            from,
            data,
        });
    }

    fn mutate<F>(&self, session_id: Uuid, apply: F) -> ColonyResult<SessionSnapshot>
    where
        F: FnOnce(&mut SessionSnapshot) -> ColonyResult<()>,
    {
        let mut sessions = self.sessions.write();
        let entry = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found(session_id))?;
        ensure_active(&entry.snapshot)?;
        apply(&mut entry.snapshot)?;
        entry.snapshot.touch();
        Ok(entry.snapshot.clone())
    }

    fn broadcast(&self, event_type: &str, payload: Value) {
        if let Some(cluster) = &self.cluster {
            let sent = cluster.broadcast_cluster_event(event_type, payload);
            debug!(event_type, sent, "Collaboration event sent to peers");
        }
    }

    fn emit(&self, event: CollabEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for CollaborationEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(session_id: Uuid) -> ColonyError {
    ColonyError::NotFound(format!("session {session_id}"))
}

fn ensure_active(session: &SessionSnapshot) -> ColonyResult<()> {
    if session.is_active() {
        Ok(())
    } else {
        Err(ColonyError::Conflict(format!(
            "session {} is completed",
            session.id
        )))
    }
}
