//! Execution layer - run admission, group sequencing, and cleanup.

#![warn(missing_docs)]

pub mod host;
pub mod lock;
pub mod context;
pub mod selector;
pub mod dependency;
pub mod cleanup;
pub mod cache_control;
pub mod engine;
mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use host::{Backend, CleanupRequest, GraphHost, JobOutcome, NodeMode, QueueStatus, SubmitReceipt};
pub use lock::{ExecutionLock, LockConfig, LockInfo};
pub use context::{ExecutionContext, RunSignals};
pub use selector::{GroupPartition, GroupSelector, MuteReason, MutedGroup};
pub use dependency::DependencyResolver;
pub use cleanup::CleanupEvaluator;
pub use cache_control::{CacheControlBus, CacheControlListener, SubscriptionId};
pub use engine::{EngineConfig, ExecutionEngine, RunReport, DEFAULT_SAMPLER_NODE_TYPES};
pub use error::{AdmissionError, BackendError, GroupError, HostError};
