//! Run state model - status, progress and timing of one run.

use crate::id::RunId;
use crate::plan::ExecutionPlan;
use crate::Time;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run status.
///
/// `Pending -> Running -> {Completed | Failed | Cancelled}`; terminal
/// values never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted, not started
    Pending,
    /// Driving groups
    Running,
    /// Finished (possibly with failed groups when errors do not pause)
    Completed,
    /// Aborted by a group failure
    Failed,
    /// Cancelled by an interrupt
    Cancelled,
}

impl RunStatus {
    /// Whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the run is still in flight.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group that failed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFailure {
    /// Group name
    pub group_name: String,
    /// Error message
    pub message: String,
}

/// Authoritative record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Run this record belongs to
    pub run_id: RunId,

    /// Current status
    pub status: RunStatus,

    /// When the record was created
    pub start_time: Time,

    /// Set exactly when the status is terminal
    pub end_time: Option<Time>,

    /// Groups that finished
    pub completed_groups: Vec<String>,

    /// Groups that failed
    pub failed_groups: Vec<GroupFailure>,

    /// Number of groups in the plan
    pub total_groups: usize,

    /// Digest of the plan
    pub config_hash: String,

    /// Group currently executing
    pub current_group: Option<String>,

    /// Run-level error message
    pub error: Option<String>,
}

impl ExecutionState {
    /// A new pending record for a plan.
    pub fn new(run_id: RunId, plan: &ExecutionPlan, now: Time) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            start_time: now,
            end_time: None,
            completed_groups: Vec::new(),
            failed_groups: Vec::new(),
            total_groups: plan.total_groups(),
            config_hash: plan.config_hash(),
            current_group: None,
            error: None,
        }
    }

    /// Completed groups as a percentage of the plan.
    pub fn progress(&self) -> f64 {
        if self.total_groups == 0 {
            return 0.0;
        }
        self.completed_groups.len() as f64 / self.total_groups as f64 * 100.0
    }

    /// Elapsed time, up to `end_time` or `now` while active.
    pub fn duration_at(&self, now: Time) -> chrono::Duration {
        self.end_time.unwrap_or(now) - self.start_time
    }

    /// Merge an update into the record.
    ///
    /// Returns false when a status change was refused because the record
    /// is already terminal. Other fields are still merged.
    pub fn apply(&mut self, update: StateUpdate, now: Time) -> bool {
        let mut accepted = true;

        if let Some(status) = update.status {
            if self.status.is_terminal() {
                accepted = status == self.status;
            } else {
                self.status = status;
                if status.is_terminal() && self.end_time.is_none() {
                    self.end_time = Some(now);
                }
            }
        }
        if let Some(group) = update.completed_group {
            if !self.completed_groups.contains(&group) {
                self.completed_groups.push(group);
            }
        }
        if let Some(failure) = update.failed_group {
            self.failed_groups.push(failure);
        }
        if let Some(current) = update.current_group {
            self.current_group = current;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }

        accepted
    }

    /// Snapshot with derived fields.
    pub fn snapshot_at(&self, now: Time) -> StateSnapshot {
        StateSnapshot {
            progress: self.progress(),
            duration_ms: self.duration_at(now).num_milliseconds(),
            state: self.clone(),
        }
    }
}

/// Partial update of an [`ExecutionState`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    /// New status
    pub status: Option<RunStatus>,
    /// Group to append to the completed list
    pub completed_group: Option<String>,
    /// Failure to append
    pub failed_group: Option<GroupFailure>,
    /// Replace the current group (`Some(None)` clears it)
    pub current_group: Option<Option<String>>,
    /// Run-level error
    pub error: Option<String>,
}

impl StateUpdate {
    /// Status-only update.
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// A group finished.
    pub fn completed(group: impl Into<String>) -> Self {
        Self {
            completed_group: Some(group.into()),
            ..Default::default()
        }
    }

    /// A group failed.
    pub fn failed(group: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failed_group: Some(GroupFailure {
                group_name: group.into(),
                message: message.into(),
            }),
            ..Default::default()
        }
    }

    /// Set or clear the current group.
    pub fn current_group(group: Option<String>) -> Self {
        Self {
            current_group: Some(group),
            ..Default::default()
        }
    }

    /// Attach a run-level error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Record plus derived progress and duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// The record
    #[serde(flatten)]
    pub state: ExecutionState,
    /// Completed share, 0-100
    pub progress: f64,
    /// Elapsed milliseconds
    pub duration_ms: i64,
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateAction {
    /// Record created
    Created,
    /// Record updated
    Updated,
    /// Record removed
    Deleted,
}

/// Change notification emitted by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    /// Affected run
    pub run_id: RunId,
    /// What happened
    pub action: StateAction,
    /// Record after the change (before removal for deletions)
    pub snapshot: StateSnapshot,
}
