//! In-memory run state store with change notification.

use crate::retention::RetentionPolicy;
use chrono::Utc;
use groupflow_core::{
    ExecutionPlan, ExecutionState, RunId, RunStatus, StateAction, StateChange, StateSnapshot,
    StateUpdate, Time,
};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Counts of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStats {
    /// Pending records
    pub pending: usize,
    /// Running records
    pub running: usize,
    /// Completed records
    pub completed: usize,
    /// Failed records
    pub failed: usize,
    /// Cancelled records
    pub cancelled: usize,
}

impl StateStats {
    /// Total number of records.
    pub fn total(&self) -> usize {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }
}

/// Keyed store of run records.
///
/// Every create, update and delete is broadcast as a [`StateChange`].
/// The store evicts old records on `create_state` once it reaches the
/// policy's size bound.
pub struct StateManager {
    states: RwLock<HashMap<RunId, ExecutionState>>,
    policy: RetentionPolicy,
    events: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a store with the given retention policy.
    pub fn new(policy: RetentionPolicy) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            states: RwLock::new(HashMap::new()),
            policy,
            events,
        }
    }

    /// The retention policy in use.
    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    fn notify(&self, run_id: &RunId, action: StateAction, snapshot: StateSnapshot) {
        // No subscribers is fine.
        let _ = self.events.send(StateChange {
            run_id: run_id.clone(),
            action,
            snapshot,
        });
    }

    /// Create the record for a run. Returns the existing one if present.
    pub async fn create_state(&self, run_id: &RunId, plan: &ExecutionPlan) -> ExecutionState {
        self.create_state_at(run_id, plan, Utc::now()).await
    }

    /// [`create_state`](Self::create_state) with an explicit clock.
    pub async fn create_state_at(
        &self,
        run_id: &RunId,
        plan: &ExecutionPlan,
        now: Time,
    ) -> ExecutionState {
        let mut states = self.states.write().await;

        if let Some(existing) = states.get(run_id) {
            debug!("State for run {} already exists", run_id);
            return existing.clone();
        }

        if states.len() >= self.policy.max_entries {
            let limit = self.policy.max_entries.saturating_sub(1);
            self.evict_locked(&mut states, now, limit);
        }

        let state = ExecutionState::new(run_id.clone(), plan, now);
        states.insert(run_id.clone(), state.clone());
        drop(states);

        debug!("Created state for run {} ({} groups)", run_id, state.total_groups);
        self.notify(run_id, StateAction::Created, state.snapshot_at(now));
        state
    }

    /// Merge an update into a run's record.
    ///
    /// Unknown run ids are ignored with a warning and yield `None`.
    pub async fn update_state(&self, run_id: &RunId, update: StateUpdate) -> Option<ExecutionState> {
        self.update_state_at(run_id, update, Utc::now()).await
    }

    /// [`update_state`](Self::update_state) with an explicit clock.
    pub async fn update_state_at(
        &self,
        run_id: &RunId,
        update: StateUpdate,
        now: Time,
    ) -> Option<ExecutionState> {
        let mut states = self.states.write().await;

        let Some(state) = states.get_mut(run_id) else {
            warn!("Ignoring update for unknown run {}", run_id);
            return None;
        };

        let requested = update.status;
        if !state.apply(update, now) {
            warn!(
                "Run {} is already {}; ignoring transition to {:?}",
                run_id, state.status, requested
            );
        }
        let state = state.clone();
        drop(states);

        self.notify(run_id, StateAction::Updated, state.snapshot_at(now));
        Some(state)
    }

    /// Get a run's record.
    pub async fn get_state(&self, run_id: &RunId) -> Option<ExecutionState> {
        self.states.read().await.get(run_id).cloned()
    }

    /// Get a run's record with derived progress and duration.
    pub async fn get_snapshot(&self, run_id: &RunId) -> Option<StateSnapshot> {
        let now = Utc::now();
        self.states
            .read()
            .await
            .get(run_id)
            .map(|s| s.snapshot_at(now))
    }

    /// Remove a run's record.
    pub async fn clear_state(&self, run_id: &RunId) -> bool {
        let removed = self.states.write().await.remove(run_id);
        match removed {
            Some(state) => {
                debug!("Cleared state for run {}", run_id);
                self.notify(run_id, StateAction::Deleted, state.snapshot_at(Utc::now()));
                true
            }
            None => false,
        }
    }

    /// Most recent record created from a plan with this hash.
    pub async fn find_by_config_hash(&self, config_hash: &str) -> Option<ExecutionState> {
        self.states
            .read()
            .await
            .values()
            .filter(|s| s.config_hash == config_hash)
            .max_by_key(|s| s.start_time)
            .cloned()
    }

    /// All records, oldest first.
    pub async fn list_states(&self) -> Vec<ExecutionState> {
        let mut all: Vec<_> = self.states.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.start_time);
        all
    }

    /// Runs that are still pending or running.
    pub async fn active_runs(&self) -> Vec<RunId> {
        self.states
            .read()
            .await
            .values()
            .filter(|s| s.status.is_active())
            .map(|s| s.run_id.clone())
            .collect()
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }

    /// Counts per status.
    pub async fn stats(&self) -> StateStats {
        let states = self.states.read().await;
        let mut stats = StateStats::default();
        for state in states.values() {
            match state.status {
                RunStatus::Pending => stats.pending += 1,
                RunStatus::Running => stats.running += 1,
                RunStatus::Completed => stats.completed += 1,
                RunStatus::Failed => stats.failed += 1,
                RunStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Apply the retention policy now. Returns the number of evicted records.
    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now()).await
    }

    /// [`cleanup`](Self::cleanup) with an explicit clock.
    pub async fn cleanup_at(&self, now: Time) -> usize {
        let mut states = self.states.write().await;
        let limit = self.policy.max_entries;
        self.evict_locked(&mut states, now, limit)
    }

    fn evict_locked(
        &self,
        states: &mut HashMap<RunId, ExecutionState>,
        now: Time,
        limit: usize,
    ) -> usize {
        let evicted = self.policy.select_evictions(states, now, limit);
        for run_id in &evicted {
            if let Some(state) = states.remove(run_id) {
                self.notify(run_id, StateAction::Deleted, state.snapshot_at(now));
            }
        }
        if !evicted.is_empty() {
            info!("Evicted {} run record(s), {} remain", evicted.len(), states.len());
        }
        if states.len() > limit {
            warn!("State store still holds {} records (bound {}), all active", states.len(), limit);
        }
        evicted.len()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}
