//! Retention policy for finished run records.

use chrono::Duration;
use groupflow_core::{ExecutionState, RunId, RunStatus, Time};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How long finished records are kept, and how many records at most.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Size bound of the store
    pub max_entries: usize,
    /// Failed records expire after this many seconds
    pub failed_ttl_secs: u64,
    /// Cancelled records expire after this many seconds
    pub cancelled_ttl_secs: u64,
    /// Completed records expire after this many seconds
    pub completed_ttl_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 100,
            failed_ttl_secs: 7 * 24 * 3600,
            cancelled_ttl_secs: 24 * 3600,
            completed_ttl_secs: 3600,
        }
    }
}

impl RetentionPolicy {
    /// Set the size bound.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Age after which a record of this status expires. Active records never do.
    pub fn ttl(&self, status: RunStatus) -> Option<Duration> {
        let secs = match status {
            RunStatus::Failed => self.failed_ttl_secs,
            RunStatus::Cancelled => self.cancelled_ttl_secs,
            RunStatus::Completed => self.completed_ttl_secs,
            RunStatus::Pending | RunStatus::Running => return None,
        };
        // chrono caps durations at i64::MAX milliseconds
        Some(Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64))
    }

    /// Keep-priority of a status; lower is evicted first. Active records have none.
    pub fn priority(status: RunStatus) -> Option<u8> {
        match status {
            RunStatus::Completed => Some(0),
            RunStatus::Cancelled => Some(1),
            RunStatus::Failed => Some(2),
            RunStatus::Pending | RunStatus::Running => None,
        }
    }

    /// Pick the records to drop so that at most `limit` remain.
    ///
    /// Phase 1 drops every terminal record older than its status TTL
    /// (measured from `end_time`). Phase 2, only while still above `limit`,
    /// drops terminal records by priority and then oldest first. Active
    /// records are never selected, so the result can stay above `limit`.
    pub fn select_evictions(
        &self,
        states: &HashMap<RunId, ExecutionState>,
        now: Time,
        limit: usize,
    ) -> Vec<RunId> {
        let mut evicted: Vec<RunId> = states
            .values()
            .filter(|s| match (self.ttl(s.status), s.end_time) {
                (Some(ttl), Some(end)) => now - end > ttl,
                _ => false,
            })
            .map(|s| s.run_id.clone())
            .collect();

        let remaining = states.len() - evicted.len();
        if remaining <= limit {
            return evicted;
        }

        let mut candidates: Vec<&ExecutionState> = states
            .values()
            .filter(|s| s.status.is_terminal() && !evicted.contains(&s.run_id))
            .collect();
        candidates.sort_by(|a, b| {
            Self::priority(a.status)
                .cmp(&Self::priority(b.status))
                .then_with(|| ended_at(a).cmp(&ended_at(b)))
        });

        evicted.extend(
            candidates
                .into_iter()
                .take(remaining - limit)
                .map(|s| s.run_id.clone()),
        );
        evicted
    }
}

fn ended_at(state: &ExecutionState) -> Time {
    state.end_time.unwrap_or(state.start_time)
}
