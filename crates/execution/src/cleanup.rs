//! Conditional post-group cleanup.

use crate::host::{Backend, CleanupRequest, GraphHost};
use crate::selector::GroupSelector;
use groupflow_core::{ExecutionPlan, UnloadCondition};
use tracing::{debug, warn};

/// Resolves a group's cleanup config against the live graph and backend.
pub struct CleanupEvaluator<'a> {
    host: &'a dyn GraphHost,
    backend: &'a dyn Backend,
    sampler_types: &'a [String],
}

impl<'a> CleanupEvaluator<'a> {
    /// Create a new evaluator.
    pub fn new(host: &'a dyn GraphHost, backend: &'a dyn Backend, sampler_types: &'a [String]) -> Self {
        Self {
            host,
            backend,
            sampler_types,
        }
    }

    /// Cleanup request for the group at `index`, or `None` when there is
    /// nothing to do.
    ///
    /// `unload_models` is only sent as true when every unload condition
    /// holds.
    pub async fn resolve(&self, plan: &ExecutionPlan, index: usize) -> Option<CleanupRequest> {
        let group = plan.groups.get(index)?;
        let config = group.cleanup_config.as_ref()?;
        if config.is_noop() {
            return None;
        }

        let unload_models =
            config.unload_models && self.all_hold(&config.unload_conditions, plan, index).await;

        Some(CleanupRequest {
            group_name: group.group_name.clone(),
            clear_vram: config.clear_vram,
            clear_ram: config.clear_ram,
            unload_models,
        })
    }

    /// AND over the conditions. An empty list holds.
    pub async fn all_hold(&self, conditions: &[UnloadCondition], plan: &ExecutionPlan, index: usize) -> bool {
        for condition in conditions {
            if !self.evaluate(condition, plan, index).await {
                debug!("Unload condition {:?} not met", condition);
                return false;
            }
        }
        true
    }

    /// Evaluate one condition for the group at `index`.
    pub async fn evaluate(&self, condition: &UnloadCondition, plan: &ExecutionPlan, index: usize) -> bool {
        match condition {
            UnloadCondition::HasNextSamplerGroup { expected } => {
                self.has_next_sampler_group(plan, index) == *expected
            }
            UnloadCondition::ParamEquals {
                node_id,
                param_name,
                expected,
            } => match self.backend.param_value(node_id, param_name).await {
                Ok(value) => value == *expected,
                Err(e) => {
                    warn!(
                        "Could not read parameter {}.{}: {}; treating condition as unmet",
                        node_id, param_name, e
                    );
                    false
                }
            },
        }
    }

    /// Whether any group after `index` that will actually run contains an
    /// enabled sampler node. Muted groups never count.
    pub fn has_next_sampler_group(&self, plan: &ExecutionPlan, index: usize) -> bool {
        let selector = GroupSelector::new(self.host);
        plan.groups.iter().skip(index + 1).any(|group| {
            if selector.mute_reason(&group.group_name).is_some() {
                return false;
            }
            self.host
                .find_nodes_in_group(&group.group_name)
                .iter()
                .filter(|id| !self.host.node_mode(id).is_disabled())
                .filter_map(|id| self.host.node_type(id))
                .any(|node_type| self.sampler_types.contains(&node_type))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NodeMode;
    use crate::testing::{Call, MockBackend, MockHost};
    use groupflow_core::{CleanupConfig, GroupSpec, NodeId};

    fn samplers() -> Vec<String> {
        vec!["KSampler".to_string(), "SamplerCustom".to_string()]
    }

    fn host() -> MockHost {
        MockHost::new()
            .with_output("Load", "1", "CheckpointLoader", &[])
            .with_node("Sample", "2", "KSampler", &["1"])
            .with_output("Sample", "3", "SaveImage", &["2"])
            .with_output("Upscale", "4", "SaveImage", &[])
            .with_node("Refine", "5", "SamplerCustom", &[])
            .with_output("Refine", "6", "SaveImage", &["5"])
    }

    fn unload(conditions: Vec<UnloadCondition>) -> CleanupConfig {
        CleanupConfig {
            unload_models: true,
            unload_conditions: conditions,
            ..Default::default()
        }
    }

    #[test]
    fn test_has_next_sampler_group() {
        let host = host();
        let backend = MockBackend::new();
        let types = samplers();
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let plan = ExecutionPlan::new(vec![
            GroupSpec::new("Load"),
            GroupSpec::new("Sample"),
            GroupSpec::new("Upscale"),
            GroupSpec::new("Refine"),
        ]);

        assert!(evaluator.has_next_sampler_group(&plan, 0));
        assert!(evaluator.has_next_sampler_group(&plan, 1));
        assert!(!evaluator.has_next_sampler_group(&plan, 3));

        host.set_mode("5", NodeMode::Bypass);
        assert!(!evaluator.has_next_sampler_group(&plan, 1));
    }

    #[test]
    fn test_muted_group_is_not_a_next_sampler_group() {
        let host = host();
        let backend = MockBackend::new();
        let types = samplers();
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let plan = ExecutionPlan::new(vec![
            GroupSpec::new("Sample"),
            GroupSpec::new("Upscale"),
            GroupSpec::new("Refine"),
        ]);
        assert!(evaluator.has_next_sampler_group(&plan, 0));

        // Refine keeps its enabled sampler but loses its only output.
        host.set_mode("6", NodeMode::Never);
        assert!(!evaluator.has_next_sampler_group(&plan, 0));

        // A group whose sampler stands alone never runs either.
        let host = MockHost::new()
            .with_output("Sample", "1", "SaveImage", &[])
            .with_node("Orphan", "2", "KSampler", &[]);
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let plan = ExecutionPlan::new(vec![GroupSpec::new("Sample"), GroupSpec::new("Orphan")]);
        assert!(!evaluator.has_next_sampler_group(&plan, 0));
    }

    #[tokio::test]
    async fn test_noop_configs_yield_nothing() {
        let host = host();
        let backend = MockBackend::new();
        let types = samplers();
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let plan = ExecutionPlan::new(vec![
            GroupSpec::new("Load"),
            GroupSpec::new("Sample").with_cleanup(CleanupConfig {
                delay_seconds: 2.0,
                ..Default::default()
            }),
        ]);

        assert_eq!(evaluator.resolve(&plan, 0).await, None);
        assert_eq!(evaluator.resolve(&plan, 1).await, None);
        assert_eq!(evaluator.resolve(&plan, 7).await, None);
    }

    #[tokio::test]
    async fn test_unload_and_logic() {
        let host = host();
        let backend = MockBackend::new()
            .with_param("10", "keep_loaded", false)
            .with_param("10", "free_memory", true);
        let types = samplers();
        let evaluator = &CleanupEvaluator::new(&host, &backend, &types);

        let param = |name: &str, expected: bool| UnloadCondition::ParamEquals {
            node_id: NodeId::from("10"),
            param_name: name.to_string(),
            expected,
        };
        let resolve_with = |conditions: Vec<UnloadCondition>| {
            let plan = ExecutionPlan::new(vec![
                GroupSpec::new("Sample").with_cleanup(unload(conditions)),
            ]);
            async move { evaluator.resolve(&plan, 0).await.map(|r| r.unload_models) }
        };

        assert_eq!(resolve_with(vec![]).await, Some(true));
        assert_eq!(
            resolve_with(vec![param("free_memory", true), param("keep_loaded", false)]).await,
            Some(true)
        );
        assert_eq!(
            resolve_with(vec![param("free_memory", true), param("keep_loaded", true)]).await,
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_unreadable_param_counts_as_unmet() {
        let host = host();
        let backend = MockBackend::new();
        let types = samplers();
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let condition = UnloadCondition::ParamEquals {
            node_id: NodeId::from("99"),
            param_name: "enabled".to_string(),
            expected: false,
        };
        let plan = ExecutionPlan::new(vec![GroupSpec::new("Sample")]);

        assert!(!evaluator.evaluate(&condition, &plan, 0).await);
        assert_eq!(
            backend.calls(),
            vec![Call::ParamValue(NodeId::from("99"), "enabled".to_string())]
        );
    }

    #[tokio::test]
    async fn test_conditions_skipped_without_unload() {
        let host = host();
        let backend = MockBackend::new();
        let types = samplers();
        let evaluator = CleanupEvaluator::new(&host, &backend, &types);
        let plan = ExecutionPlan::new(vec![GroupSpec::new("Sample").with_cleanup(CleanupConfig {
            clear_ram: true,
            unload_conditions: vec![UnloadCondition::ParamEquals {
                node_id: NodeId::from("10"),
                param_name: "x".to_string(),
                expected: true,
            }],
            ..Default::default()
        })]);

        let request = evaluator.resolve(&plan, 0).await.unwrap();
        assert!(request.clear_ram);
        assert!(!request.unload_models);
        assert!(backend.calls().is_empty());
    }
}
