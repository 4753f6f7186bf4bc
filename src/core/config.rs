//! Plan and engine configuration

use crate::advise::AdviserSpec;
use crate::core::error::{EngineError, Result};
use crate::core::plan::Plan;
use crate::step::StepType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Top-level plan configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Plan name (also the plan id)
    pub name: String,

    /// Plan version (optional)
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default = "default_scope")]
    pub account: String,

    #[serde(default = "default_scope")]
    pub org: String,

    #[serde(default = "default_scope")]
    pub project: String,

    /// Values applied to every node that does not override them
    #[serde(default)]
    pub defaults: PlanDefaults,

    /// Stage-level advisers, consulted only when a node's own advisers decline
    #[serde(default)]
    pub failure_strategy: Vec<AdviserSpec>,

    /// Plan nodes
    pub nodes: Vec<NodeConfig>,
}

fn default_scope() -> String {
    "default".to_string()
}

/// Plan-wide node defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDefaults {
    /// Retries granted to every node when no adviser says otherwise
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Backoff between those retries
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,

    /// Wait deadline for task and async steps (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Node configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Human-readable node name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Registered step type that runs this node
    pub step_type: String,

    /// Opaque step parameters, parsed by the step itself
    #[serde(default)]
    pub parameters: Value,

    /// Top-level nodes that must succeed before this one starts
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Plan nodes this node may spawn as children
    #[serde(default)]
    pub children: Vec<String>,

    /// Step-level advisers, in evaluation order
    #[serde(default)]
    pub advisers: Vec<AdviserSpec>,

    /// Wait deadline for this node (overrides plan defaults)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Shorthand for a retry adviser with this many retries
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]*$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

impl PlanConfig {
    /// Load plan configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse plan configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PlanConfig = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Configuration(format!("invalid plan YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the plan configuration
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::Configuration(format!(
                "plan '{}' has no nodes",
                self.name
            )));
        }

        let mut seen_ids = HashSet::new();
        for node in &self.nodes {
            if !identifier_pattern().is_match(&node.id) {
                return Err(EngineError::Configuration(format!(
                    "invalid node id '{}'",
                    node.id
                )));
            }
            if !seen_ids.insert(node.id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
        }

        let child_ids: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(|n| n.children.iter().map(String::as_str))
            .collect();

        for node in &self.nodes {
            for dep in &node.depends_on {
                if !seen_ids.contains(dep.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "node '{}' depends on non-existent node '{}'",
                        node.id, dep
                    )));
                }
                if child_ids.contains(dep.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "node '{}' depends on child node '{}'",
                        node.id, dep
                    )));
                }
            }

            if child_ids.contains(node.id.as_str()) && !node.depends_on.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "child node '{}' cannot declare depends_on",
                    node.id
                )));
            }

            for child in &node.children {
                if child == &node.id {
                    return Err(EngineError::Configuration(format!(
                        "node '{}' lists itself as a child",
                        node.id
                    )));
                }
                if !seen_ids.contains(child.as_str()) {
                    return Err(EngineError::Configuration(format!(
                        "node '{}' has non-existent child '{}'",
                        node.id, child
                    )));
                }
            }

            for adviser in &node.advisers {
                if let Some(target) = adviser.target() {
                    if !seen_ids.contains(target) {
                        return Err(EngineError::Configuration(format!(
                            "node '{}' adviser targets non-existent node '{}'",
                            node.id, target
                        )));
                    }
                }
            }
        }

        for adviser in &self.failure_strategy {
            if let Some(target) = adviser.target() {
                if !seen_ids.contains(target) {
                    return Err(EngineError::Configuration(format!(
                        "failure strategy targets non-existent node '{}'",
                        target
                    )));
                }
            }
        }

        self.check_cycles()?;

        Ok(())
    }

    /// Check for cycles through `depends_on` and `children` edges
    fn check_cycles(&self) -> Result<()> {
        let edges: HashMap<&str, Vec<&str>> = self
            .nodes
            .iter()
            .map(|n| {
                let targets = n
                    .depends_on
                    .iter()
                    .chain(n.children.iter())
                    .map(String::as_str)
                    .collect();
                (n.id.as_str(), targets)
            })
            .collect();

        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(node.id.as_str()) {
                Self::dfs_check(&node.id, &edges, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check<'a>(
        node_id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        recursion_stack: &mut HashSet<&'a str>,
    ) -> Result<()> {
        visited.insert(node_id);
        recursion_stack.insert(node_id);

        for &next in edges.get(node_id).map(Vec::as_slice).unwrap_or_default() {
            if recursion_stack.contains(next) {
                return Err(EngineError::Configuration(format!(
                    "cycle detected in plan graph involving node '{}'",
                    next
                )));
            }
            if !visited.contains(next) {
                Self::dfs_check(next, edges, visited, recursion_stack)?;
            }
        }

        recursion_stack.remove(node_id);
        Ok(())
    }

    /// Step types referenced by this plan
    pub fn step_types(&self) -> HashSet<StepType> {
        self.nodes
            .iter()
            .map(|n| StepType::new(n.step_type.as_str()))
            .collect()
    }

    /// Convert config to a Plan domain model
    pub fn to_plan(&self) -> Plan {
        Plan::from_config(self)
    }
}

/// Which response-event transport the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Partitioned queue with redelivery
    #[default]
    Queued,
    /// In-process call straight into the orchestrator
    Direct,
}

impl std::str::FromStr for TransportKind {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(TransportKind::Queued),
            "direct" => Ok(TransportKind::Direct),
            other => Err(EngineError::Configuration(format!(
                "unknown transport '{}'",
                other
            ))),
        }
    }
}

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub transport: TransportKind,

    /// Queue partitions; events for one node always share a partition
    pub partitions: usize,

    /// Concurrent step invocations
    pub worker_concurrency: usize,

    /// Bounded wait for a node's lock
    pub lock_wait: Duration,

    /// Re-read-and-retry budget on optimistic save conflicts
    pub max_state_conflict_retries: u32,

    /// Delivery attempts before an event is treated as undeliverable
    pub max_delivery_attempts: u32,

    pub delivery_backoff: Duration,

    pub timeout_sweep_interval: Duration,

    /// Deadline for task waits when neither step nor plan sets one
    pub default_task_timeout: Duration,

    /// Most recent applied events kept in the journal
    pub journal_capacity: usize,

    /// How long finished plan runs and closed tasks stay queryable
    pub retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Queued,
            partitions: 4,
            worker_concurrency: 8,
            lock_wait: Duration::from_secs(5),
            max_state_conflict_retries: 5,
            max_delivery_attempts: 3,
            delivery_backoff: Duration::from_millis(50),
            timeout_sweep_interval: Duration::from_millis(250),
            default_task_timeout: Duration::from_secs(3600),
            journal_capacity: 10_000,
            retention: Duration::from_secs(600),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn with_max_state_conflict_retries(mut self, retries: u32) -> Self {
        self.max_state_conflict_retries = retries;
        self
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_delivery_backoff(mut self, backoff: Duration) -> Self {
        self.delivery_backoff = backoff;
        self
    }

    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }

    pub fn with_journal_capacity(mut self, capacity: usize) -> Self {
        self.journal_capacity = capacity;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}
