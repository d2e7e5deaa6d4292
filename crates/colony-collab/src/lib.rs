//! Collaboration sessions for groups of colony agents.
//!
//! A session groups agents working on one plan, splits the work between
//! them through a pluggable [`Partitioner`], and aggregates their progress.
//! Every change is announced to peer nodes as a `collab_*` cluster event.
//!
//! # Main types
//!
//! - [`CollaborationEngine`] — Session store and mutation API.
//! - [`SessionSnapshot`] — A session's participants, assignments, and status.
//! - [`SpatialPartitioner`] — Default strategy: x-axis slices of `metadata.workArea`.

/// The engine.
pub mod engine;
/// Partitioning strategies.
pub mod partition;
/// Session data model.
pub mod session;

pub use engine::{CollabEvent, CollaborationEngine};
pub use partition::{Partitioner, SpatialPartitioner};
pub use session::{
    Assignment, NewSession, Participant, SessionSnapshot, SessionStatus, WorkArea,
};
