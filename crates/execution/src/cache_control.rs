//! Cache-control fan-out to caching-aware listeners.

use groupflow_core::{CacheControlEvent, CacheControlSignal, GroupCacheState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Receives cache-control changes.
pub trait CacheControlListener: Send + Sync {
    /// Called after a group's cache state changed.
    fn on_cache_control(&self, event: &CacheControlEvent);
}

impl<F> CacheControlListener for F
where
    F: Fn(&CacheControlEvent) + Send + Sync,
{
    fn on_cache_control(&self, event: &CacheControlEvent) {
        self(event)
    }
}

/// Handle returned by [`CacheControlBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer registry holding the latest state per group.
#[derive(Default)]
pub struct CacheControlBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn CacheControlListener>)>>,
    states: RwLock<HashMap<String, GroupCacheState>>,
    next_id: AtomicU64,
}

impl CacheControlBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: Arc<dyn CacheControlListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Record the new state and notify every listener.
    pub fn publish(&self, event: CacheControlEvent) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.group_name.clone(), event.state);

        // Listeners may unsubscribe from inside the callback.
        let listeners: Vec<_> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        debug!(
            "Cache control: group '{}' enabled={} ({} listeners)",
            event.group_name,
            event.state.enabled,
            listeners.len()
        );
        for listener in listeners {
            listener.on_cache_control(&event);
        }
    }

    /// Seed group states from a run request without notifying.
    pub fn load_signal(&self, signal: &CacheControlSignal) {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        for (group, state) in &signal.groups_state {
            states.insert(group.clone(), *state);
        }
    }

    /// Latest known state of a group.
    pub fn group_state(&self, group_name: &str) -> Option<GroupCacheState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_name)
            .copied()
    }
}
