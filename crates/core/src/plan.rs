//! Execution plan model - what a run is asked to do.

use crate::cache::{CacheControlMode, CacheControlSignal};
use crate::error::CoreError;
use crate::id::{NodeId, RunId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Duration;

fn default_pause_on_error() -> bool {
    true
}

fn default_execution_timeout() -> u64 {
    300
}

fn default_max_retry_count() -> u32 {
    3
}

/// An ordered list of groups to execute one after the other.
///
/// Consumed once per run and never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Groups in execution order
    pub groups: Vec<GroupSpec>,

    /// Whether downstream caches are told to distrust a group while it runs
    #[serde(default, alias = "cache_control_mode")]
    pub cache_control_mode: CacheControlMode,

    /// Abort the run on the first group failure
    #[serde(default = "default_pause_on_error", alias = "pause_on_error")]
    pub pause_on_error: bool,

    /// Requested execution timeout in seconds (advisory)
    #[serde(default = "default_execution_timeout", alias = "execution_timeout_seconds")]
    pub execution_timeout_seconds: u64,

    /// Requested retry budget (accepted, no automatic retry)
    #[serde(default = "default_max_retry_count", alias = "max_retry_count")]
    pub max_retry_count: u32,
}

impl ExecutionPlan {
    /// Create a plan with default settings.
    pub fn new(groups: Vec<GroupSpec>) -> Self {
        Self {
            groups,
            cache_control_mode: CacheControlMode::default(),
            pause_on_error: default_pause_on_error(),
            execution_timeout_seconds: default_execution_timeout(),
            max_retry_count: default_max_retry_count(),
        }
    }

    /// Set cache control mode.
    pub fn with_cache_control(mut self, mode: CacheControlMode) -> Self {
        self.cache_control_mode = mode;
        self
    }

    /// Set pause-on-error.
    pub fn with_pause_on_error(mut self, pause: bool) -> Self {
        self.pause_on_error = pause;
        self
    }

    /// Number of configured groups.
    pub fn total_groups(&self) -> usize {
        self.groups.len()
    }

    /// Requested execution timeout.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    /// Check the plan for malformed entries.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();

        for (index, group) in self.groups.iter().enumerate() {
            if group.group_name.trim().is_empty() {
                return Err(CoreError::InvalidPlan(format!("group #{} has an empty name", index)));
            }
            if !seen.insert(group.group_name.as_str()) {
                return Err(CoreError::InvalidPlan(format!(
                    "group '{}' appears more than once",
                    group.group_name
                )));
            }
            if let Some(cleanup) = &group.cleanup_config {
                if !cleanup.delay_seconds.is_finite() || cleanup.delay_seconds < 0.0 {
                    return Err(CoreError::InvalidPlan(format!(
                        "group '{}' has invalid delay_seconds {}",
                        group.group_name, cleanup.delay_seconds
                    )));
                }
            }
        }

        Ok(())
    }

    /// Stable hex digest of the plan, used for dedup lookups.
    pub fn config_hash(&self) -> String {
        // Value maps are key-sorted, so the string form is canonical.
        let canonical = serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// One named group of graph nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    /// Name of the group in the host graph
    #[serde(alias = "group_name")]
    pub group_name: String,

    /// Post-group cleanup
    #[serde(default, alias = "cleanup_config", skip_serializing_if = "Option::is_none")]
    pub cleanup_config: Option<CleanupConfig>,
}

impl GroupSpec {
    /// Create a group without cleanup.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            cleanup_config: None,
        }
    }

    /// Attach a cleanup configuration.
    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup_config = Some(cleanup);
        self
    }
}

/// Resource reclamation to run after a group finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Clear accelerator memory
    #[serde(default)]
    pub clear_vram: bool,

    /// Clear host memory
    #[serde(default)]
    pub clear_ram: bool,

    /// Unload models (gated by `unload_conditions`)
    #[serde(default)]
    pub unload_models: bool,

    /// All must hold for `unload_models` to apply
    #[serde(default)]
    pub unload_conditions: Vec<UnloadCondition>,

    /// Settle time after cleanup
    #[serde(default)]
    pub delay_seconds: f64,
}

impl CleanupConfig {
    /// True when no cleanup flag is set.
    pub fn is_noop(&self) -> bool {
        !(self.clear_vram || self.clear_ram || self.unload_models)
    }

    /// Settle delay as a duration. Invalid values map to zero.
    pub fn delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.delay_seconds).unwrap_or_default()
    }
}

/// A runtime check gating model unloading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnloadCondition {
    /// Whether a later group contains a sampler node
    HasNextSamplerGroup {
        /// Expected answer
        expected: bool,
    },

    /// Whether a live parameter equals a boolean
    ParamEquals {
        /// Node that owns the parameter
        #[serde(rename = "nodeId", alias = "node_id")]
        node_id: NodeId,
        /// Parameter name
        #[serde(rename = "paramName", alias = "param_name")]
        param_name: String,
        /// Expected value
        expected: bool,
    },
}

/// Inbound request to start a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Run identifier
    #[serde(alias = "run_id")]
    pub run_id: RunId,

    /// What to execute
    pub plan: ExecutionPlan,

    /// Initial cache-control state
    #[serde(default, alias = "cache_control_signal")]
    pub cache_control_signal: CacheControlSignal,

    /// Session the request claims to come from
    #[serde(alias = "origin_id")]
    pub origin_id: String,
}

impl RunRequest {
    /// Create a request with empty cache-control state.
    pub fn new(run_id: impl Into<RunId>, plan: ExecutionPlan, origin_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            plan,
            cache_control_signal: CacheControlSignal::default(),
            origin_id: origin_id.into(),
        }
    }
}
