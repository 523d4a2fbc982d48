//! Cache-control model - per-group trust signals for caching nodes.

use crate::Time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the engine signals downstream caches while groups run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheControlMode {
    /// Disable a group's cache before it runs, re-enable it afterwards
    BlockUntilAllowed,
    /// Leave cache state untouched
    #[default]
    Passthrough,
}

/// Cache-control state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCacheState {
    /// Whether caches may trust this group's previous result
    pub enabled: bool,

    /// Last change
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: Time,

    /// Completed executions seen for this group
    #[serde(default, alias = "execution_count")]
    pub execution_count: u32,
}

impl GroupCacheState {
    /// A fresh, enabled state.
    pub fn enabled_now() -> Self {
        Self {
            enabled: true,
            timestamp: chrono::Utc::now(),
            execution_count: 0,
        }
    }

    /// Mark the group as recomputing.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.timestamp = chrono::Utc::now();
    }

    /// Mark the group as done recomputing.
    pub fn enable_after_run(&mut self) {
        self.enabled = true;
        self.timestamp = chrono::Utc::now();
        self.execution_count = self.execution_count.saturating_add(1);
    }
}

/// Cache-control directive carried by a run request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheControlSignal {
    /// Group name -> state
    #[serde(default, alias = "groups_state")]
    pub groups_state: HashMap<String, GroupCacheState>,
}

/// Broadcast whenever the engine changes a group's cache state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheControlEvent {
    /// Run that caused the change
    pub run_id: crate::RunId,

    /// Affected group
    pub group_name: String,

    /// New state
    pub state: GroupCacheState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_from_millis_json() {
        let json = r#"{"groupsState": {"Load": {"enabled": false, "timestamp": 1700000000000, "executionCount": 2}}}"#;
        let signal: CacheControlSignal = serde_json::from_str(json).unwrap();

        let load = signal.groups_state["Load"];
        assert!(!load.enabled);
        assert_eq!(load.execution_count, 2);
        assert_eq!(load.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_enable_after_run_counts() {
        let mut state = GroupCacheState::enabled_now();
        state.disable();
        assert!(!state.enabled);
        state.enable_after_run();
        assert!(state.enabled);
        assert_eq!(state.execution_count, 1);
    }

    #[test]
    fn test_execution_count_saturates() {
        let json = r#"{"enabled": true, "timestamp": 0, "executionCount": 4294967295}"#;
        let mut state: GroupCacheState = serde_json::from_str(json).unwrap();
        state.enable_after_run();
        assert_eq!(state.execution_count, u32::MAX);
    }
}
