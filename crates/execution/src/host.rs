//! Collaborator interfaces: the graph host and the remote backend.

use crate::error::{BackendError, HostError};
use async_trait::async_trait;
use groupflow_core::{NodeId, PromptGraph, RunId};
use serde::{Deserialize, Serialize};

/// Execution mode of a graph node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeMode {
    /// Runs normally
    #[default]
    Normal,
    /// Muted; never runs
    Never,
    /// Passes inputs through without running
    Bypass,
}

impl NodeMode {
    /// Whether the node is silenced.
    pub fn is_disabled(self) -> bool {
        matches!(self, Self::Never | Self::Bypass)
    }
}

/// The node-graph editor the engine runs against.
///
/// Lookups are synchronous views of the live graph; only the prompt
/// conversion is async.
#[async_trait]
pub trait GraphHost: Send + Sync {
    /// Ids of the nodes inside a named group.
    fn find_nodes_in_group(&self, group_name: &str) -> Vec<NodeId>;

    /// Whether a node produces a terminal artifact.
    fn is_output_node(&self, node_id: &NodeId) -> bool;

    /// Current mode of a node.
    fn node_mode(&self, node_id: &NodeId) -> NodeMode;

    /// Type name of a node.
    fn node_type(&self, node_id: &NodeId) -> Option<String>;

    /// Snapshot the whole graph as a prompt.
    async fn graph_to_prompt(&self) -> Result<PromptGraph, HostError>;
}

/// Running and pending job counts of the remote queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Jobs executing
    pub running: usize,
    /// Jobs waiting
    pub pending: usize,
}

impl QueueStatus {
    /// Both counts are zero.
    pub fn is_drained(&self) -> bool {
        self.running == 0 && self.pending == 0
    }
}

/// Acknowledgement of a submitted job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Backend job id, when the backend returns one
    pub prompt_id: Option<String>,
}

/// How the backend recorded a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Ran to the end, successfully or not
    Finished,
    /// Aborted while executing
    Interrupted {
        /// What the backend reported
        reason: String,
    },
    /// The backend has no record of the job
    Unknown,
}

/// Resolved cleanup actions for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRequest {
    /// Group that just finished
    pub group_name: String,
    /// Clear accelerator memory
    pub clear_vram: bool,
    /// Clear host memory
    pub clear_ram: bool,
    /// Unload models
    pub unload_models: bool,
}

/// The remote execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Enqueue a job. Completion is observed through [`queue_status`](Self::queue_status).
    async fn submit_job(&self, prompt: &PromptGraph) -> Result<SubmitReceipt, BackendError>;

    /// Current queue counts.
    async fn queue_status(&self) -> Result<QueueStatus, BackendError>;

    /// How a submitted job ended. Asked once the queue has drained.
    async fn job_outcome(&self, prompt_id: &str) -> Result<JobOutcome, BackendError>;

    /// Interrupt whatever is executing.
    async fn interrupt(&self) -> Result<(), BackendError>;

    /// Tell the backend which group is executing (`None` clears it).
    async fn set_current_group(&self, group_name: Option<&str>) -> Result<(), BackendError>;

    /// Release the backend's exclusive permission for a run.
    async fn release_permission(&self, run_id: &RunId) -> Result<bool, BackendError>;

    /// Reclaim memory after a group.
    async fn cleanup_memory(&self, request: &CleanupRequest) -> Result<(), BackendError>;

    /// Live boolean parameter value.
    async fn param_value(&self, node_id: &NodeId, param_name: &str) -> Result<bool, BackendError>;

    /// Node types that count as samplers.
    async fn sampler_node_types(&self) -> Result<Vec<String>, BackendError>;
}
