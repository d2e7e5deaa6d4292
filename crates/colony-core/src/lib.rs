//! Core types and shared primitives for the colony agent scheduler.
//!
//! This crate holds what every other colony crate agrees on: the task model
//! and its admission validator, the error enum, the deadline-bound completion
//! map, and the traits that let the scheduler, cluster, and collaboration
//! crates talk to each other without depending on one another.
//!
//! # Main types
//!
//! - [`ColonyError`] — Unified error enum, one variant per failure kind.
//! - [`TaskRequest`] — Wire form of a task, before admission.
//! - [`Task`] — An admitted, immutable task with a typed [`ActionSpec`].
//! - [`validate()`] — Total, side-effect free admission check.
//! - [`CompletionMap`] — Keyed completion handles with deadline and cancellation.
//! - [`ClusterBroadcast`] / [`TaskExecutor`] — Seams between subsystems.

/// Cross-crate traits and cluster event tags.
pub mod cluster;
/// Deadline-bound completion handles.
pub mod completion;
/// Error definitions.
pub mod error;
/// Task model.
pub mod task;
/// Admission validation.
pub mod validate;

pub use cluster::{collab_events, ClusterBroadcast, TaskExecutor};
pub use completion::{CompletionHandle, CompletionMap, CompletionStats};
pub use error::{ColonyError, ColonyResult};
pub use task::{
    ActionSpec, CombatStyle, Position, Priority, RecipeIngredient, Target, Task, TaskAction,
    TaskRequest, DEFAULT_SENDER,
};
pub use validate::{validate, Validation, MAX_DETAILS_LEN};
