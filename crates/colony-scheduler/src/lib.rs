//! Task scheduling and dispatch for a colony node.
//!
//! Admitted tasks go straight to an idle agent whose role they accept, or
//! wait in a bounded priority queue. The dispatcher owns each task's safety
//! timer and reports its lifecycle as a stream of [`SchedulerEvent`]s.
//!
//! # Main types
//!
//! - [`Dispatcher`] — Matches agents and tasks; drives completion and timeouts.
//! - [`TaskQueue`] — Priority-banded queue with backpressure and eviction.
//! - [`AgentRegistry`] — Agent lifecycle state in registration order.
//! - [`Bridge`] — Actuation layer interface; [`SimulationBridge`] stands in for a world.
//! - [`AutonomyController`] — Periodic task synthesis through an [`Oracle`].

/// Periodic oracle-driven task generation.
pub mod autonomy;
/// Bridge interface and the simulation bridge.
pub mod bridge;
/// Scheduler and autonomy configuration.
pub mod config;
/// The dispatcher.
pub mod dispatcher;
/// Scheduler event stream.
pub mod events;
/// Oracle interface and the mock oracle.
pub mod oracle;
/// Agent registry.
pub mod registry;
/// Priority queue.
pub mod task_queue;
/// Agent, snapshot, and metrics types.
pub mod types;

pub use autonomy::{AutonomyController, CycleOutcome, MISSING_ORACLE};
pub use bridge::{Bridge, BridgeEvent, DispatchReceipt, SimulationBridge};
pub use config::{AutonomyConfig, SchedulerConfig, SimulationConfig};
pub use dispatcher::{Dispatcher, Submission};
pub use events::{EventBus, SchedulerEvent};
pub use oracle::{MockOracle, Oracle, OracleResponse};
pub use registry::AgentRegistry;
pub use task_queue::{Enqueued, QueueEntry, TaskQueue};
pub use types::{
    Agent, AgentSnapshot, AgentState, CompletionReason, DispatchMetrics, QueuedTaskSummary,
    StatusSnapshot, TaskOutcome, Transport,
};
