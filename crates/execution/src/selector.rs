//! Group selection - which planned groups actually run.

use crate::host::GraphHost;
use groupflow_core::{ExecutionPlan, NodeId};
use std::fmt;

/// Why a group is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteReason {
    /// The group resolves to no runnable output node
    NoOutputNodes,
    /// Every member node is in never or bypass mode
    AllDisabled,
}

impl fmt::Display for MuteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOutputNodes => write!(f, "no output nodes"),
            Self::AllDisabled => write!(f, "all nodes disabled"),
        }
    }
}

/// A planned group that will not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutedGroup {
    /// Position in the plan
    pub index: usize,
    /// Group name
    pub group_name: String,
    /// Why it is skipped
    pub reason: MuteReason,
}

/// Plan groups split into the ones to execute and the muted ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupPartition {
    /// Plan indices to execute, in order
    pub active: Vec<usize>,
    /// Groups skipped
    pub muted: Vec<MutedGroup>,
}

impl GroupPartition {
    /// Whether the group at `index` is muted.
    pub fn is_muted(&self, index: usize) -> bool {
        self.muted.iter().any(|m| m.index == index)
    }
}

/// Resolves groups against the live graph.
pub struct GroupSelector<'a> {
    host: &'a dyn GraphHost,
}

impl<'a> GroupSelector<'a> {
    /// Create a new selector over a graph host.
    pub fn new(host: &'a dyn GraphHost) -> Self {
        Self { host }
    }

    /// Output nodes of a group that are in normal mode.
    pub fn output_nodes(&self, group_name: &str) -> Vec<NodeId> {
        self.host
            .find_nodes_in_group(group_name)
            .into_iter()
            .filter(|id| self.host.is_output_node(id) && !self.host.node_mode(id).is_disabled())
            .collect()
    }

    /// Whether a group is muted, and why.
    pub fn mute_reason(&self, group_name: &str) -> Option<MuteReason> {
        let members = self.host.find_nodes_in_group(group_name);
        if !members.is_empty() && members.iter().all(|id| self.host.node_mode(id).is_disabled()) {
            return Some(MuteReason::AllDisabled);
        }
        if self.output_nodes(group_name).is_empty() {
            return Some(MuteReason::NoOutputNodes);
        }
        None
    }

    /// Split a plan's groups.
    pub fn partition(&self, plan: &ExecutionPlan) -> GroupPartition {
        let mut partition = GroupPartition::default();
        for (index, group) in plan.groups.iter().enumerate() {
            match self.mute_reason(&group.group_name) {
                Some(reason) => partition.muted.push(MutedGroup {
                    index,
                    group_name: group.group_name.clone(),
                    reason,
                }),
                None => partition.active.push(index),
            }
        }
        partition
    }
}
