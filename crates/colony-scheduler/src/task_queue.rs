use crate::events::{EventBus, SchedulerEvent};
use chrono::{DateTime, Utc};
use colony_core::{ColonyError, ColonyResult, Task};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};
use uuid::Uuid;

/// A pending task and when it was queued.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    /// The queued task.
    pub task: Task,
    /// When the task entered the queue.
    pub enqueued_at: DateTime<Utc>,
}

/// Result of a successful [`TaskQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct Enqueued {
    /// 1-based position of the admitted task.
    pub position: usize,
    /// Lower-priority tail task evicted to make room.
    pub evicted: Option<Task>,
}

/// Bounded queue ordered by priority band, FIFO within a band.
///
/// When full, an arrival evicts the tail only if it strictly outranks it.
pub struct TaskQueue {
    entries: VecDeque<QueueEntry>,
    max_size: usize,
    events: EventBus,
}

impl TaskQueue {
    /// Empty queue holding at most `max_size` tasks, reporting on `events`.
    pub fn new(max_size: usize, events: EventBus) -> Self {
        Self {
            entries: VecDeque::new(),
            max_size: max_size.max(1),
            events,
        }
    }

    /// Admit a task at the end of its priority band.
    ///
    /// Emits `task_dropped` for an evicted tail, or `task_rejected` and returns
    /// [`ColonyError::QueueFull`] when the task does not outrank the tail.
    pub fn enqueue(&mut self, task: Task) -> ColonyResult<Enqueued> {
        let mut evicted = None;
        if self.entries.len() >= self.max_size {
            let tail_priority = match self.entries.back() {
                Some(tail) => tail.task.priority,
                None => task.priority,
            };
            if task.priority <= tail_priority {
                warn!(
                    task_id = %task.id,
                    priority = %task.priority,
                    tail_priority = %tail_priority,
                    "Queue full, task rejected"
                );
                let err = ColonyError::QueueFull {
                    task_id: task.id,
                    priority: task.priority,
                    tail_priority,
                };
                self.events.emit(SchedulerEvent::TaskRejected {
                    task,
                    reason: err.to_string(),
                });
                return Err(err);
            }
            if let Some(dropped) = self.entries.pop_back() {
                warn!(
                    task_id = %dropped.task.id,
                    by = %task.id,
                    "Queue full, lower-priority tail evicted"
                );
                self.events.emit(SchedulerEvent::TaskDropped {
                    task: dropped.task.clone(),
                    reason: format!("evicted by higher-priority task {}", task.id),
                });
                evicted = Some(dropped.task);
            }
        }

        let index = self
            .entries
            .iter()
            .position(|e| e.task.priority < task.priority)
            .unwrap_or(self.entries.len());
        debug!(task_id = %task.id, position = index + 1, "Task enqueued");
        self.entries.insert(
            index,
            QueueEntry {
                task,
                enqueued_at: Utc::now(),
            },
        );
        Ok(Enqueued {
            position: index + 1,
            evicted,
        })
    }

    /// First entry, scanning from the head, that satisfies `predicate`.
    pub fn find_first_match<P>(&self, predicate: P) -> Option<&QueueEntry>
    where
        P: Fn(&Task) -> bool,
    {
        self.entries.iter().find(|e| predicate(&e.task))
    }

    /// Best task for an idle agent with `role`.
    ///
    /// Prefers the first entry that accepts `role`. If no entry accepts any of
    /// `idle_roles`, falls back to the head so the queue cannot stall.
    pub fn select_for(&self, role: &str, idle_roles: &[String]) -> Option<Uuid> {
        if let Some(entry) = self.find_first_match(|t| t.accepts_role(role)) {
            return Some(entry.task.id);
        }
        let any_match = self
            .find_first_match(|t| idle_roles.iter().any(|r| t.accepts_role(r)))
            .is_some();
        if any_match {
            None
        } else {
            self.entries.front().map(|e| e.task.id)
        }
    }

    /// Take a task out wherever it sits.
    pub fn remove(&mut self, task_id: Uuid) -> Option<Task> {
        let index = self.entries.iter().position(|e| e.task.id == task_id)?;
        self.entries.remove(index).map(|e| e.task)
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity set at construction.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Head-to-tail copy of the queue.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Remove and return every entry, head first.
    pub fn drain(&mut self) -> Vec<Task> {
        self.entries.drain(..).map(|e| e.task).collect()
    }
}
