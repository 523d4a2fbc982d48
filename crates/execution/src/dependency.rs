//! Dependency resolution over a prompt graph.

use groupflow_core::{NodeId, PromptGraph};
use std::collections::BTreeSet;

/// Resolves which nodes a set of output nodes needs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Targets plus everything they transitively read from.
    ///
    /// Targets missing from the graph are dropped. Links to ids that are
    /// not in the graph are not followed. Cycles terminate through the
    /// visited set.
    pub fn required_nodes(&self, graph: &PromptGraph, targets: &[NodeId]) -> BTreeSet<NodeId> {
        let mut required = BTreeSet::new();
        let mut stack: Vec<NodeId> = targets
            .iter()
            .filter(|id| graph.contains(id))
            .cloned()
            .collect();

        while let Some(id) = stack.pop() {
            if !required.insert(id.clone()) {
                continue;
            }
            let Some(node) = graph.get(&id) else {
                continue;
            };
            stack.extend(
                node.linked_sources()
                    .filter(|source| graph.contains(source) && !required.contains(source)),
            );
        }

        required
    }

    /// Subgraph holding exactly [`required_nodes`](Self::required_nodes).
    pub fn restrict(&self, graph: &PromptGraph, targets: &[NodeId]) -> PromptGraph {
        let required = self.required_nodes(graph, targets);
        let mut job = PromptGraph::new();
        for id in required {
            if let Some(node) = graph.get(&id) {
                job.insert(id, node.clone());
            }
        }
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groupflow_core::PromptNode;
    use serde_json::json;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    /// 1 -> 2 -> 3 (output), 4 -> 5 (output), 6 unrelated
    fn sample_graph() -> PromptGraph {
        let mut graph = PromptGraph::new();
        graph.insert(id("1"), PromptNode::new("CheckpointLoader"));
        graph.insert(id("2"), PromptNode::new("KSampler").with_link("model", &id("1"), 0));
        graph.insert(id("3"), PromptNode::new("SaveImage").with_link("images", &id("2"), 0));
        graph.insert(id("4"), PromptNode::new("LoadImage"));
        graph.insert(id("5"), PromptNode::new("PreviewImage").with_link("images", &id("4"), 0));
        graph.insert(id("6"), PromptNode::new("Note"));
        graph
    }

    #[test]
    fn test_walks_transitive_inputs() {
        let required = DependencyResolver::new().required_nodes(&sample_graph(), &[id("3")]);
        assert_eq!(required, [id("1"), id("2"), id("3")].into_iter().collect());
    }

    #[test]
    fn test_restrict_excludes_unrelated_nodes() {
        let job = DependencyResolver::new().restrict(&sample_graph(), &[id("3"), id("5")]);
        assert_eq!(job.len(), 5);
        assert!(!job.contains(&id("6")));
    }

    #[test]
    fn test_dangling_links_and_missing_targets() {
        let mut graph = PromptGraph::new();
        graph.insert(
            id("1"),
            PromptNode::new("SaveImage")
                .with_link("images", &id("99"), 0)
                .with_input("size", json!([512, 512])),
        );

        let required = DependencyResolver::new().required_nodes(&graph, &[id("1"), id("42")]);
        assert_eq!(required, [id("1")].into_iter().collect());
    }

    #[test]
    fn test_cycle_terminates() {
        let mut graph = PromptGraph::new();
        graph.insert(id("a"), PromptNode::new("Loop").with_link("x", &id("b"), 0));
        graph.insert(id("b"), PromptNode::new("Loop").with_link("x", &id("a"), 0));

        let required = DependencyResolver::new().required_nodes(&graph, &[id("a")]);
        assert_eq!(required.len(), 2);
    }
}
