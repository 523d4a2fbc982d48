//! In-memory collaborators for unit tests.

use crate::error::{BackendError, HostError};
use crate::host::{Backend, CleanupRequest, GraphHost, JobOutcome, NodeMode, QueueStatus, SubmitReceipt};
use async_trait::async_trait;
use groupflow_core::{NodeId, PromptGraph, PromptNode, RunId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct MockNode {
    pub class_type: String,
    pub mode: NodeMode,
    pub output: bool,
    pub inputs: Vec<NodeId>,
}

/// A graph host backed by fixed groups and nodes. Node modes can be
/// changed while a run is in flight.
#[derive(Debug, Default)]
pub(crate) struct MockHost {
    groups: HashMap<String, Vec<NodeId>>,
    nodes: Mutex<HashMap<NodeId, MockNode>>,
    fail_conversion: bool,
    conversion_delay: Duration,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node that is not an output.
    pub fn with_node(self, group: &str, id: &str, class_type: &str, inputs: &[&str]) -> Self {
        self.insert(group, id, class_type, false, inputs)
    }

    /// Add an output node.
    pub fn with_output(self, group: &str, id: &str, class_type: &str, inputs: &[&str]) -> Self {
        self.insert(group, id, class_type, true, inputs)
    }

    /// Add a node outside every group.
    pub fn with_loose_node(self, id: &str, class_type: &str) -> Self {
        self.nodes.lock().unwrap().insert(
            NodeId::from(id),
            MockNode {
                class_type: class_type.to_string(),
                mode: NodeMode::Normal,
                output: false,
                inputs: Vec::new(),
            },
        );
        self
    }

    /// Declare a group without nodes.
    pub fn with_empty_group(mut self, group: &str) -> Self {
        self.groups.entry(group.to_string()).or_default();
        self
    }

    pub fn with_failing_conversion(mut self) -> Self {
        self.fail_conversion = true;
        self
    }

    /// Every prompt conversion takes this long.
    pub fn with_conversion_delay(mut self, delay: Duration) -> Self {
        self.conversion_delay = delay;
        self
    }

    pub fn set_mode(&self, id: &str, mode: NodeMode) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(&NodeId::from(id)) {
            node.mode = mode;
        }
    }

    fn insert(mut self, group: &str, id: &str, class_type: &str, output: bool, inputs: &[&str]) -> Self {
        let node_id = NodeId::from(id);
        self.groups
            .entry(group.to_string())
            .or_default()
            .push(node_id.clone());
        self.nodes.lock().unwrap().insert(
            node_id,
            MockNode {
                class_type: class_type.to_string(),
                mode: NodeMode::Normal,
                output,
                inputs: inputs.iter().map(|s| NodeId::from(*s)).collect(),
            },
        );
        self
    }
}

#[async_trait]
impl GraphHost for MockHost {
    fn find_nodes_in_group(&self, group_name: &str) -> Vec<NodeId> {
        self.groups.get(group_name).cloned().unwrap_or_default()
    }

    fn is_output_node(&self, node_id: &NodeId) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .is_some_and(|n| n.output)
    }

    fn node_mode(&self, node_id: &NodeId) -> NodeMode {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| n.mode)
            .unwrap_or_default()
    }

    fn node_type(&self, node_id: &NodeId) -> Option<String> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .map(|n| n.class_type.clone())
    }

    async fn graph_to_prompt(&self) -> Result<PromptGraph, HostError> {
        if !self.conversion_delay.is_zero() {
            tokio::time::sleep(self.conversion_delay).await;
        }
        if self.fail_conversion {
            return Err(HostError::Conversion("canvas not ready".into()));
        }
        let nodes = self.nodes.lock().unwrap();
        let mut graph = PromptGraph::new();
        for (id, node) in nodes.iter().filter(|(_, n)| !n.mode.is_disabled()) {
            let prompt_node = node
                .inputs
                .iter()
                .enumerate()
                .fold(PromptNode::new(node.class_type.clone()), |acc, (i, source)| {
                    acc.with_link(format!("input_{}", i), source, 0)
                });
            graph.insert(id.clone(), prompt_node);
        }
        Ok(graph)
    }
}

/// Everything the engine asked the backend for, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Submit(Vec<NodeId>),
    QueueStatus { drained: bool },
    JobOutcome(String),
    Interrupt,
    SetCurrentGroup(Option<String>),
    ReleasePermission(RunId),
    Cleanup(CleanupRequest),
    ParamValue(NodeId, String),
    SamplerNodeTypes,
}

/// A backend whose queue drains after a configured number of busy polls.
#[derive(Debug)]
pub(crate) struct MockBackend {
    calls: Mutex<Vec<Call>>,
    /// Busy polls before each submitted job drains, consumed per submit
    busy_plan: Mutex<VecDeque<usize>>,
    busy_remaining: Mutex<usize>,
    default_busy: usize,
    fail_submit_containing: HashSet<NodeId>,
    fail_status: bool,
    fail_cleanup: bool,
    interrupted_jobs: HashMap<String, String>,
    params: HashMap<(NodeId, String), bool>,
    sampler_types: Option<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            busy_plan: Mutex::new(VecDeque::new()),
            busy_remaining: Mutex::new(0),
            default_busy: 1,
            fail_submit_containing: HashSet::new(),
            fail_status: false,
            fail_cleanup: false,
            interrupted_jobs: HashMap::new(),
            params: HashMap::new(),
            sampler_types: Some(vec!["KSampler".to_string()]),
        }
    }
}

impl MockBackend {
    /// Queue never drains.
    pub const NEVER: usize = usize::MAX;

    pub fn new() -> Self {
        Self::default()
    }

    /// Busy polls for successive submissions.
    pub fn with_busy_polls(self, plan: &[usize]) -> Self {
        self.busy_plan.lock().unwrap().extend(plan.iter().copied());
        self
    }

    pub fn with_failing_submit(mut self, node: &str) -> Self {
        self.fail_submit_containing.insert(NodeId::from(node));
        self
    }

    pub fn with_failing_status(mut self) -> Self {
        self.fail_status = true;
        self
    }

    pub fn with_failing_cleanup(mut self) -> Self {
        self.fail_cleanup = true;
        self
    }

    /// Report the job with this prompt id (`p1`, `p2`, ...) as interrupted.
    pub fn with_interrupted_job(mut self, prompt_id: &str, reason: &str) -> Self {
        self.interrupted_jobs.insert(prompt_id.to_string(), reason.to_string());
        self
    }

    pub fn with_param(mut self, node: &str, param: &str, value: bool) -> Self {
        self.params.insert((NodeId::from(node), param.to_string()), value);
        self
    }

    /// `None` makes the sampler-type lookup fail.
    pub fn with_sampler_types(mut self, types: Option<&[&str]>) -> Self {
        self.sampler_types = types.map(|t| t.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submits(&self) -> Vec<Vec<NodeId>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit(nodes) => Some(nodes),
                _ => None,
            })
            .collect()
    }

    pub fn cleanups(&self) -> Vec<CleanupRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Cleanup(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn unavailable(endpoint: &str) -> BackendError {
        BackendError::Request {
            endpoint: endpoint.to_string(),
            message: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn submit_job(&self, prompt: &PromptGraph) -> Result<SubmitReceipt, BackendError> {
        let nodes: Vec<NodeId> = prompt.nodes.keys().cloned().collect();
        self.record(Call::Submit(nodes.clone()));

        if nodes.iter().any(|n| self.fail_submit_containing.contains(n)) {
            return Err(BackendError::Status {
                endpoint: "/prompt".to_string(),
                status: 400,
                body: "invalid prompt".to_string(),
            });
        }

        let busy = self
            .busy_plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_busy);
        *self.busy_remaining.lock().unwrap() = busy;
        Ok(SubmitReceipt {
            prompt_id: Some(format!("p{}", self.submits().len())),
        })
    }

    async fn queue_status(&self) -> Result<QueueStatus, BackendError> {
        if self.fail_status {
            self.record(Call::QueueStatus { drained: false });
            return Err(Self::unavailable("/queue"));
        }
        let mut remaining = self.busy_remaining.lock().unwrap();
        let status = if *remaining == 0 {
            QueueStatus::default()
        } else {
            if *remaining != Self::NEVER {
                *remaining -= 1;
            }
            QueueStatus { running: 1, pending: 0 }
        };
        drop(remaining);
        self.record(Call::QueueStatus {
            drained: status.is_drained(),
        });
        Ok(status)
    }

    async fn job_outcome(&self, prompt_id: &str) -> Result<JobOutcome, BackendError> {
        self.record(Call::JobOutcome(prompt_id.to_string()));
        Ok(match self.interrupted_jobs.get(prompt_id) {
            Some(reason) => JobOutcome::Interrupted {
                reason: reason.clone(),
            },
            None => JobOutcome::Finished,
        })
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.record(Call::Interrupt);
        Ok(())
    }

    async fn set_current_group(&self, group_name: Option<&str>) -> Result<(), BackendError> {
        self.record(Call::SetCurrentGroup(group_name.map(str::to_string)));
        Ok(())
    }

    async fn release_permission(&self, run_id: &RunId) -> Result<bool, BackendError> {
        self.record(Call::ReleasePermission(run_id.clone()));
        Ok(true)
    }

    async fn cleanup_memory(&self, request: &CleanupRequest) -> Result<(), BackendError> {
        self.record(Call::Cleanup(request.clone()));
        if self.fail_cleanup {
            return Err(Self::unavailable("/group_executor/cleanup"));
        }
        Ok(())
    }

    async fn param_value(&self, node_id: &NodeId, param_name: &str) -> Result<bool, BackendError> {
        self.record(Call::ParamValue(node_id.clone(), param_name.to_string()));
        self.params
            .get(&(node_id.clone(), param_name.to_string()))
            .copied()
            .ok_or_else(|| Self::unavailable("/group_executor/param_value"))
    }

    async fn sampler_node_types(&self) -> Result<Vec<String>, BackendError> {
        self.record(Call::SamplerNodeTypes);
        self.sampler_types
            .clone()
            .ok_or_else(|| Self::unavailable("/group_executor/sampler_node_types"))
    }
}
