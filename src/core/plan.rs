//! Plan domain model

use crate::advise::{AdviserSpec, ExhaustedAction};
use crate::core::{
    ambiance::Ambiance,
    config::{PlanConfig, PlanDefaults},
    state::NodeStatus,
};
use crate::step::StepType;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Static definition of one unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub id: String,
    pub name: String,
    pub step_type: StepType,
    pub parameters: Value,
    pub depends_on: Vec<String>,
    pub children: Vec<String>,
    /// Step-level advisers, retry shorthand first
    pub advisers: Vec<AdviserSpec>,
    pub timeout_secs: Option<u64>,
}

/// A plan definition
#[derive(Debug, Clone)]
pub struct Plan {
    /// Plan identifier (the configured name)
    pub id: String,
    pub version: Option<String>,
    pub account: String,
    pub org: String,
    pub project: String,

    pub nodes: HashMap<String, PlanNode>,

    /// Stage-level advisers
    pub stage_advisers: Vec<AdviserSpec>,

    pub defaults: PlanDefaults,

    /// Nodes only ever started by a parent
    child_ids: HashSet<String>,

    /// Node order (topological sort)
    execution_order: Vec<String>,
}

impl Plan {
    /// Create a plan from configuration
    pub fn from_config(config: &PlanConfig) -> Self {
        let nodes: HashMap<String, PlanNode> = config
            .nodes
            .iter()
            .map(|node_config| {
                let mut advisers = Vec::new();
                if let Some(max_retries) = node_config.max_retries {
                    advisers.push(AdviserSpec::Retry {
                        max_retries,
                        backoff_ms: config.defaults.retry_backoff_ms.unwrap_or(0),
                        on_exhausted: ExhaustedAction::MarkFailure,
                    });
                }
                advisers.extend(node_config.advisers.iter().cloned());

                let node = PlanNode {
                    id: node_config.id.clone(),
                    name: node_config
                        .name
                        .clone()
                        .unwrap_or_else(|| node_config.id.clone()),
                    step_type: StepType::new(node_config.step_type.as_str()),
                    parameters: node_config.parameters.clone(),
                    depends_on: node_config.depends_on.clone(),
                    children: node_config.children.clone(),
                    advisers,
                    timeout_secs: node_config.timeout_secs,
                };
                (node.id.clone(), node)
            })
            .collect();

        let mut stage_advisers = config.failure_strategy.clone();
        if let Some(max_retries) = config.defaults.max_retries {
            stage_advisers.push(AdviserSpec::Retry {
                max_retries,
                backoff_ms: config.defaults.retry_backoff_ms.unwrap_or(0),
                on_exhausted: ExhaustedAction::MarkFailure,
            });
        }

        let child_ids = config
            .nodes
            .iter()
            .flat_map(|n| n.children.iter().cloned())
            .collect();

        let execution_order = Self::topological_sort(&nodes);

        Plan {
            id: config.name.clone(),
            version: config.version.clone(),
            account: config.account.clone(),
            org: config.org.clone(),
            project: config.project.clone(),
            nodes,
            stage_advisers,
            defaults: config.defaults.clone(),
            child_ids,
            execution_order,
        }
    }

    /// Get a node by ID
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    /// Whether the node is only reachable through a parent
    pub fn is_child(&self, id: &str) -> bool {
        self.child_ids.contains(id)
    }

    /// Root ambiance for one run of this plan
    pub fn root_scope(&self, plan_execution_id: Uuid) -> Ambiance {
        Ambiance::new(
            self.account.as_str(),
            self.org.as_str(),
            self.project.as_str(),
            self.id.as_str(),
            plan_execution_id,
        )
    }

    /// Top-level nodes not yet instantiated whose dependencies all succeeded or were skipped
    ///
    /// `statuses` holds the status of the effective execution of every instantiated top-level node.
    pub fn ready_nodes(&self, statuses: &HashMap<String, NodeStatus>) -> Vec<&PlanNode> {
        self.execution_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| !self.is_child(&node.id) && !statuses.contains_key(&node.id))
            .filter(|node| {
                node.depends_on.iter().all(|dep| {
                    matches!(
                        statuses.get(dep),
                        Some(NodeStatus::Succeeded) | Some(NodeStatus::Skipped)
                    )
                })
            })
            .collect()
    }

    /// Top-level nodes that list `id` in their dependencies
    pub fn dependents_of(&self, id: &str) -> Vec<&PlanNode> {
        self.execution_order
            .iter()
            .filter_map(|node_id| self.nodes.get(node_id))
            .filter(|node| node.depends_on.iter().any(|dep| dep == id))
            .collect()
    }

    /// Wait deadline for a node, falling back to plan defaults
    pub fn timeout_secs_for(&self, node: &PlanNode) -> Option<u64> {
        node.timeout_secs.or(self.defaults.timeout_secs)
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Calculate topological sort of nodes based on dependencies
    fn topological_sort(nodes: &HashMap<String, PlanNode>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        // Sort for deterministic order
        let mut node_ids: Vec<_> = nodes.keys().cloned().collect();
        node_ids.sort();

        for node_id in node_ids {
            if !visited.contains(&node_id) {
                Self::visit(&node_id, nodes, &mut visited, &mut result);
            }
        }

        result
    }

    fn visit(
        node_id: &str,
        nodes: &HashMap<String, PlanNode>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node_id) {
            return;
        }
        visited.insert(node_id.to_string());

        if let Some(node) = nodes.get(node_id) {
            for dep in &node.depends_on {
                Self::visit(dep, nodes, visited, result);
            }
        }

        result.push(node_id.to_string());
    }
}
