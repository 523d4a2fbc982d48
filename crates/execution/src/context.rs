//! Per-run execution context and cancellation signals.

use crate::error::GroupError;
use groupflow_core::{
    CacheControlSignal, ExecutionPlan, GroupCacheState, GroupFailure, RunId,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation flags of one run.
///
/// `cancel` is the host-level abort; `interrupt` is raised when the backend
/// reports that the running job was aborted. Cancel takes precedence.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    cancel: CancellationToken,
    interrupt: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
}

impl RunSignals {
    /// Create unset signals.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mark the run as interrupted by the backend. The first reason wins.
    pub fn interrupt(&self, reason: impl Into<String>) {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| reason.into());
        self.interrupt.cancel();
    }

    /// Whether either signal is raised.
    pub fn is_raised(&self) -> bool {
        self.cancel.is_cancelled() || self.interrupt.is_cancelled()
    }

    /// Checkpoint: error if either signal is raised.
    pub fn check(&self) -> Result<(), GroupError> {
        if self.cancel.is_cancelled() {
            return Err(GroupError::Cancelled);
        }
        if self.interrupt.is_cancelled() {
            let reason = self
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default();
            return Err(GroupError::RemoteInterrupted { reason });
        }
        Ok(())
    }

    /// Resolves once either signal is raised.
    pub async fn raised(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.interrupt.cancelled() => {}
        }
    }

    /// Sleep that wakes early when a signal is raised.
    pub async fn sleep(&self, duration: Duration) -> Result<(), GroupError> {
        tokio::select! {
            _ = self.raised() => {}
            _ = tokio::time::sleep(duration) => {}
        }
        self.check()
    }

    /// Drive a future unless a signal is raised first.
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, GroupError> {
        tokio::select! {
            _ = self.raised() => Err(self.check().err().unwrap_or(GroupError::Cancelled)),
            output = future => Ok(output),
        }
    }
}

/// Engine-local bookkeeping of one admitted run.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Run id
    pub run_id: RunId,
    /// The plan being executed
    pub plan: Arc<ExecutionPlan>,
    /// Session the request came from
    pub origin_id: String,
    /// Cache-control state per group
    pub cache_state: HashMap<String, GroupCacheState>,
    /// Admission time
    pub started_at: Instant,
    /// Groups that finished
    pub completed_groups: Vec<String>,
    /// Groups that failed
    pub failed_groups: Vec<GroupFailure>,
    /// Groups that were muted or had nothing to submit
    pub skipped_groups: Vec<String>,
    /// Group being executed
    pub current_group: Option<String>,
    /// Requested retry budget; recorded, not acted on
    pub max_retry_count: u32,
    /// Cancellation flags
    pub signals: RunSignals,
}

impl ExecutionContext {
    /// Create a context for an admitted run.
    pub fn new(
        run_id: RunId,
        plan: ExecutionPlan,
        origin_id: String,
        signal: CacheControlSignal,
        signals: RunSignals,
    ) -> Self {
        Self {
            max_retry_count: plan.max_retry_count,
            run_id,
            plan: Arc::new(plan),
            origin_id,
            cache_state: signal.groups_state,
            started_at: Instant::now(),
            completed_groups: Vec::new(),
            failed_groups: Vec::new(),
            skipped_groups: Vec::new(),
            current_group: None,
            signals,
        }
    }

    /// Time since admission.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Set a group's cache flag and return its new state.
    pub fn set_cache_enabled(&mut self, group_name: &str, enabled: bool) -> GroupCacheState {
        let state = self
            .cache_state
            .entry(group_name.to_string())
            .or_insert_with(GroupCacheState::enabled_now);
        if enabled {
            state.enable_after_run();
        } else {
            state.disable();
        }
        *state
    }

    /// Record a failed group.
    pub fn record_failure(&mut self, group_name: &str, error: &GroupError) -> GroupFailure {
        let failure = GroupFailure {
            group_name: group_name.to_string(),
            message: error.to_string(),
        };
        self.failed_groups.push(failure.clone());
        failure
    }
}
