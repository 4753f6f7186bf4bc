//! Scope metadata travelling with every node execution

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::step::StepType;

/// One entry of the ancestry stack: the node execution that owns this level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub node_execution_id: Uuid,
    pub plan_node_id: String,
    pub step_type: StepType,
    pub retry_index: u32,
}

/// Execution scope: who owns the run, which run, and where in the tree we are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub account_id: String,
    pub org_id: String,
    pub project_id: String,
    pub plan_id: String,
    pub plan_execution_id: Uuid,

    /// Root first, current node last
    #[serde(default)]
    pub levels: Vec<Level>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Ambiance {
    pub fn new(
        account_id: impl Into<String>,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        plan_id: impl Into<String>,
        plan_execution_id: Uuid,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            org_id: org_id.into(),
            project_id: project_id.into(),
            plan_id: plan_id.into(),
            plan_execution_id,
            levels: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Ambiance of the enclosing level
    pub fn parent_scope(&self) -> Self {
        let mut parent = self.clone();
        parent.levels.pop();
        parent
    }

    /// Ambiance one level deeper
    pub fn with_level(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }

    /// Replace the innermost level, used when a node is retried as a new execution
    pub fn with_replaced_level(&self, level: Level) -> Self {
        let mut ambiance = self.clone();
        ambiance.levels.pop();
        ambiance.levels.push(level);
        ambiance
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn node_execution_id(&self) -> Option<Uuid> {
        self.current_level().map(|l| l.node_execution_id)
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Flattened key/value form handed to delegates as scope metadata
    pub fn scope_metadata(&self) -> HashMap<String, String> {
        let mut scope = self.metadata.clone();
        scope.insert("accountId".to_string(), self.account_id.clone());
        scope.insert("orgIdentifier".to_string(), self.org_id.clone());
        scope.insert("projectIdentifier".to_string(), self.project_id.clone());
        scope.insert("planId".to_string(), self.plan_id.clone());
        scope.insert(
            "planExecutionId".to_string(),
            self.plan_execution_id.to_string(),
        );
        if let Some(level) = self.current_level() {
            scope.insert(
                "nodeExecutionId".to_string(),
                level.node_execution_id.to_string(),
            );
            scope.insert("stepType".to_string(), level.step_type.to_string());
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(plan_node_id: &str, retry_index: u32) -> Level {
        Level {
            node_execution_id: Uuid::new_v4(),
            plan_node_id: plan_node_id.to_string(),
            step_type: StepType::new("echo"),
            retry_index,
        }
    }

    #[test]
    fn test_levels_stack() {
        let root = Ambiance::new("acc", "org", "proj", "plan", Uuid::new_v4());
        let stage = root.with_level(level("stage", 0));
        let step = stage.with_level(level("step", 0));

        assert_eq!(root.depth(), 0);
        assert_eq!(step.depth(), 2);
        assert_eq!(step.current_level().unwrap().plan_node_id, "step");
        assert_eq!(step.plan_execution_id, root.plan_execution_id);
    }

    #[test]
    fn test_replaced_level_keeps_depth() {
        let ambiance = Ambiance::new("acc", "org", "proj", "plan", Uuid::new_v4())
            .with_level(level("stage", 0))
            .with_level(level("step", 0));
        let retried = ambiance.with_replaced_level(level("step", 1));

        assert_eq!(retried.depth(), 2);
        assert_eq!(retried.current_level().unwrap().retry_index, 1);
        assert_eq!(retried.levels[0], ambiance.levels[0]);
    }

    #[test]
    fn test_scope_metadata() {
        let ambiance = Ambiance::new("acc", "org", "proj", "plan", Uuid::new_v4())
            .with_level(level("step", 0));
        let scope = ambiance.scope_metadata();

        assert_eq!(scope.get("accountId"), Some(&"acc".to_string()));
        assert_eq!(scope.get("stepType"), Some(&"echo".to_string()));
        assert!(scope.contains_key("nodeExecutionId"));
    }
}
