//! Prompt graph snapshot - the job payload sent to the backend queue.

use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One node of a prompt graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptNode {
    /// Node type name
    pub class_type: String,

    /// Widget values and input links
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Host metadata carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PromptNode {
    /// Create a node without inputs.
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: Map::new(),
            extra: Map::new(),
        }
    }

    /// Add an input value.
    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Add an input linked to another node's output slot.
    pub fn with_link(self, name: impl Into<String>, source: &NodeId, slot: u32) -> Self {
        self.with_input(name, Value::Array(vec![Value::from(source.as_str()), Value::from(slot)]))
    }

    /// Node ids referenced by `[node_id, slot]` inputs.
    ///
    /// Callers still have to check the ids exist in the graph; plain
    /// two-element list widgets look the same on the wire.
    pub fn linked_sources(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.inputs.values().filter_map(|value| match value.as_array()?.as_slice() {
            [Value::String(id), slot] if slot.is_u64() => Some(NodeId::new(id.clone())),
            [Value::Number(id), slot] if slot.is_u64() => Some(NodeId::new(id.to_string())),
            _ => None,
        })
    }
}

/// Full prompt graph, keyed by node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptGraph {
    /// Nodes by id
    pub nodes: BTreeMap<NodeId, PromptNode>,
}

impl PromptGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node.
    pub fn insert(&mut self, id: NodeId, node: PromptNode) {
        self.nodes.insert(id, node);
    }

    /// Look up a node.
    pub fn get(&self, id: &NodeId) -> Option<&PromptNode> {
        self.nodes.get(id)
    }

    /// Whether the node exists.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_linked_sources_detects_links_only() {
        let node: PromptNode = serde_json::from_value(json!({
            "class_type": "KSampler",
            "inputs": {
                "model": ["4", 0],
                "positive": [6, 0],
                "seed": 42,
                "size": [512, 512.5],
                "label": "x"
            },
            "_meta": {"title": "Sampler"}
        }))
        .unwrap();

        let mut sources: Vec<_> = node.linked_sources().collect();
        sources.sort();
        assert_eq!(sources, vec![NodeId::from("4"), NodeId::from("6")]);
        assert!(node.extra.contains_key("_meta"));
    }

    #[test]
    fn test_graph_roundtrips_as_plain_map() {
        let mut graph = PromptGraph::new();
        graph.insert(NodeId::from("1"), PromptNode::new("CheckpointLoader"));
        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value["1"]["class_type"], "CheckpointLoader");
    }
}
