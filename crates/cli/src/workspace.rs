//! Workspace snapshot file acting as the graph host.

use anyhow::{Context, Result};
use async_trait::async_trait;
use groupflow_core::{NodeId, PromptGraph, PromptNode};
use groupflow_execution::{GraphHost, HostError, NodeMode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// One node of a saved workspace.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceNode {
    /// Node type name
    pub class_type: String,

    /// Execution mode
    #[serde(default)]
    pub mode: NodeMode,

    /// Whether the node produces a terminal artifact
    #[serde(default, alias = "outputNode")]
    pub output_node: bool,

    /// Widget values and `[node_id, slot]` links
    #[serde(default)]
    pub inputs: Map<String, Value>,
}

/// Groups and nodes exported from the editor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceSnapshot {
    /// Group name -> member node ids
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<NodeId>>,

    /// Nodes by id
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, WorkspaceNode>,
}

impl WorkspaceSnapshot {
    /// Read a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workspace {}", path.display()))?;
        let snapshot: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse workspace {}", path.display()))?;
        Ok(snapshot)
    }
}

#[async_trait]
impl GraphHost for WorkspaceSnapshot {
    fn find_nodes_in_group(&self, group_name: &str) -> Vec<NodeId> {
        self.groups.get(group_name).cloned().unwrap_or_default()
    }

    fn is_output_node(&self, node_id: &NodeId) -> bool {
        self.nodes.get(node_id).is_some_and(|n| n.output_node)
    }

    fn node_mode(&self, node_id: &NodeId) -> NodeMode {
        self.nodes.get(node_id).map(|n| n.mode).unwrap_or_default()
    }

    fn node_type(&self, node_id: &NodeId) -> Option<String> {
        self.nodes.get(node_id).map(|n| n.class_type.clone())
    }

    async fn graph_to_prompt(&self) -> Result<PromptGraph, HostError> {
        let mut prompt = PromptGraph::new();
        // Silenced nodes never reach the backend.
        for (id, node) in self.nodes.iter().filter(|(_, n)| !n.mode.is_disabled()) {
            let mut prompt_node = PromptNode::new(node.class_type.clone());
            prompt_node.inputs = node.inputs.clone();
            prompt.insert(id.clone(), prompt_node);
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupflow_core::{ExecutionPlan, GroupSpec};
    use groupflow_execution::GroupSelector;
    use std::io::Write;

    const WORKSPACE: &str = r#"{
        "groups": { "Load": ["1", "2"], "Sample": [3, 4], "Muted": ["5"] },
        "nodes": {
            "1": { "class_type": "CheckpointLoader", "inputs": { "ckpt_name": "model.safetensors" } },
            "2": { "class_type": "PreviewImage", "output_node": true, "inputs": { "images": ["1", 0] } },
            "3": { "class_type": "KSampler", "inputs": { "model": ["1", 0], "seed": 7 } },
            "4": { "class_type": "SaveImage", "outputNode": true, "inputs": { "images": [3, 0] } },
            "5": { "class_type": "SaveImage", "output_node": true, "mode": "bypass" }
        }
    }"#;

    fn write_workspace() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WORKSPACE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_accepts_numeric_ids() {
        let file = write_workspace();
        let snapshot = WorkspaceSnapshot::load(file.path()).unwrap();

        assert_eq!(
            snapshot.find_nodes_in_group("Sample"),
            vec![NodeId::from("3"), NodeId::from("4")]
        );
        assert!(snapshot.is_output_node(&NodeId::from("4")));
        assert_eq!(snapshot.node_type(&NodeId::from("3")).as_deref(), Some("KSampler"));
        assert_eq!(snapshot.node_mode(&NodeId::from("5")), NodeMode::Bypass);
    }

    #[test]
    fn test_selector_over_snapshot() {
        let file = write_workspace();
        let snapshot = WorkspaceSnapshot::load(file.path()).unwrap();
        let plan = ExecutionPlan::new(vec![
            GroupSpec::new("Load"),
            GroupSpec::new("Muted"),
            GroupSpec::new("Sample"),
        ]);

        let partition = GroupSelector::new(&snapshot).partition(&plan);
        assert_eq!(partition.active, vec![0, 2]);
        assert_eq!(partition.muted[0].group_name, "Muted");
    }

    #[tokio::test]
    async fn test_prompt_drops_disabled_nodes() {
        let file = write_workspace();
        let snapshot = WorkspaceSnapshot::load(file.path()).unwrap();

        let prompt = snapshot.graph_to_prompt().await.unwrap();
        assert_eq!(prompt.len(), 4);
        assert!(!prompt.contains(&NodeId::from("5")));
        let sampler = prompt.get(&NodeId::from("3")).unwrap();
        assert_eq!(sampler.inputs["seed"], 7);
    }

    #[test]
    fn test_load_reports_path() {
        let err = WorkspaceSnapshot::load(Path::new("/nonexistent/workspace.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/workspace.json"));
    }
}
