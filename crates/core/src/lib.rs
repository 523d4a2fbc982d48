//! groupflow core data models.
//!
//! This crate defines the plan, state and cache-control structures shared
//! by the state store, the execution engine and its collaborators.

#![warn(missing_docs)]

// Identities
mod id;

// Inputs
mod plan;
mod cache;
mod prompt;

// Run records
mod state;
mod error;

// Re-exports
pub use id::{NodeId, RunId};

pub use plan::{CleanupConfig, ExecutionPlan, GroupSpec, RunRequest, UnloadCondition};
pub use cache::{CacheControlEvent, CacheControlMode, CacheControlSignal, GroupCacheState};
pub use prompt::{PromptGraph, PromptNode};

pub use state::{
    ExecutionState, GroupFailure, RunStatus, StateAction, StateChange, StateSnapshot, StateUpdate,
};
pub use error::CoreError;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
