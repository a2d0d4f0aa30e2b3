//! Run reports with persistence support.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::resource::{NodeState, Outputs};

/// Overall state of a stack run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Run has not started
    #[default]
    Pending,
    /// Run is in progress
    Running,
    /// Every node settled and every export resolved
    Completed,
    /// At least one node failed or an export is unresolved
    Failed,
    /// Run was cancelled
    Cancelled,
}

/// Terminal record of one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub name: String,
    pub type_tag: String,
    pub state: NodeState,
    /// Provider calls made, including retries
    pub attempts: u32,
    /// Resolved inputs, if the node got as far as executing
    pub inputs: Option<Outputs>,
    pub outputs: Option<Outputs>,
    pub error: Option<CoreError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeReport {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            state: NodeState::Declared,
            attempts: 0,
            inputs: None,
            outputs: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Whether the provider was ever invoked for this node.
    pub fn was_applied(&self) -> bool {
        self.attempts > 0
    }
}

/// A failed resource, named by resource and type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeFailure {
    pub resource: String,
    pub type_tag: String,
    pub error: CoreError,
}

/// Result of running a stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stack: String,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Every node, in declaration order
    pub nodes: Vec<NodeReport>,
    /// Resolved exports
    pub exports: BTreeMap<String, Value>,
    /// Exports that failed or never settled
    pub unresolved_exports: BTreeMap<String, CoreError>,
    /// Failed nodes, including those failed by a dependency
    pub errors: Vec<NodeFailure>,
    /// Export sinks that could not be written
    pub sink_errors: BTreeMap<String, CoreError>,
}

impl RunReport {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stack: stack.into(),
            state: ExecutionState::Pending,
            started_at: Utc::now(),
            completed_at: None,
            nodes: Vec::new(),
            exports: BTreeMap::new(),
            unresolved_exports: BTreeMap::new(),
            errors: Vec::new(),
            sink_errors: BTreeMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.node(name).map(|n| n.state)
    }

    pub fn export(&self, name: &str) -> Option<&Value> {
        self.exports.get(name)
    }

    /// Failures that originated at the failing node itself.
    pub fn root_failures(&self) -> Vec<&NodeFailure> {
        self.errors
            .iter()
            .filter(|f| !f.error.is_dependency_failure())
            .collect()
    }

    /// Number of nodes in a given state.
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.iter().filter(|n| n.state == state).count()
    }

    /// Save the report as JSON.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        debug!("Saved run report to {:?}", path);
        Ok(())
    }

    /// Load a report from disk.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let report: Self = serde_json::from_str(&content)?;
        Ok(report)
    }
}
