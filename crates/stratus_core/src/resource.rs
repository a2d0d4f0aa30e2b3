//! Resource nodes and the provider interface.
//!
//! A resource node is one declared unit of infrastructure: a virtual network,
//! a managed cluster, an ingress. Its inputs mix literal values and deferred
//! values; its outputs are always deferred values, written only by the
//! scheduler once the provider call for the node completes.
//!
//! # Node Lifecycle
//!
//! 1. **Declared**: registered with a `Stack`; nothing has executed.
//! 2. **Pending**: the run has started but some inputs have not settled.
//! 3. **Executing**: inputs settled, provider call in flight.
//! 4. **Settled** / **Failed** / **Cancelled**: terminal and immutable.
//!
//! # Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use stratus_core::{ApplyRequest, CoreResult, Outputs, Provider, ResourceSchema};
//!
//! struct NetworkProvider;
//!
//! #[async_trait]
//! impl Provider for NetworkProvider {
//!     fn type_tag(&self) -> &str { "network" }
//!     fn description(&self) -> &str { "Virtual networks" }
//!     fn schema(&self) -> ResourceSchema {
//!         ResourceSchema::new().require("addressSpace").output("id")
//!     }
//!
//!     async fn apply(&self, request: &ApplyRequest) -> CoreResult<Outputs> {
//!         // Create or update the network here
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::deferred::Deferred;
use crate::error::{CoreError, CoreResult};
use crate::input::Inputs;
use crate::options::ResourceOptions;

/// Resolved output record returned by a provider.
pub type Outputs = Map<String, Value>;

/// Identifier of a resource: the owning stack plus its declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    stack: Uuid,
    index: usize,
}

impl ResourceId {
    pub(crate) fn new(stack: Uuid, index: usize) -> Self {
        Self { stack, index }
    }

    /// Identity of the stack that declared the resource.
    pub fn stack(&self) -> Uuid {
        self.stack
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// Lifecycle state of a resource node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Registered, run not started
    #[default]
    Declared,
    /// Waiting on inputs
    Pending,
    /// Provider call in flight
    Executing,
    /// Outputs resolved
    Settled,
    /// Provider call or an input failed
    Failed,
    /// Stack was cancelled before the node settled
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Failed | Self::Cancelled)
    }
}

/// Input and output fields accepted for a type tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Inputs that must be present
    pub required_inputs: Vec<String>,
    /// Inputs that may be present
    pub optional_inputs: Vec<String>,
    /// Outputs the provider returns
    pub outputs: Vec<String>,
    /// Accept input fields not listed above
    pub open: bool,
}

impl ResourceSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required_inputs.push(field.into());
        self
    }

    pub fn optional(mut self, field: impl Into<String>) -> Self {
        self.optional_inputs.push(field.into());
        self
    }

    pub fn output(mut self, field: impl Into<String>) -> Self {
        self.outputs.push(field.into());
        self
    }

    pub fn open(mut self) -> Self {
        self.open = true;
        self
    }

    /// Check an input record against this schema.
    pub fn validate(&self, type_tag: &str, name: &str, inputs: &Inputs) -> CoreResult<()> {
        let missing: Vec<&str> = self
            .required_inputs
            .iter()
            .map(|f| f.as_str())
            .filter(|f| !inputs.contains(f))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::Declaration(format!(
                "{} '{}' is missing required inputs: {}",
                type_tag,
                name,
                missing.join(", ")
            )));
        }

        if !self.open {
            let unknown: Vec<&str> = inputs
                .names()
                .filter(|f| {
                    !self.required_inputs.iter().any(|r| r == f)
                        && !self.optional_inputs.iter().any(|o| o == f)
                })
                .collect();
            if !unknown.is_empty() {
                return Err(CoreError::Declaration(format!(
                    "{} '{}' has unknown inputs: {}",
                    type_tag,
                    name,
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// A provider call with fully resolved inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Logical resource name, stable across runs
    pub name: String,
    pub type_tag: String,
    pub inputs: Outputs,
}

impl ApplyRequest {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>, inputs: Outputs) -> Self {
        Self {
            name: name.into(),
            type_tag: type_tag.into(),
            inputs,
        }
    }

    /// String input by field name.
    pub fn str_input(&self, field: &str) -> CoreResult<&str> {
        self.inputs
            .get(field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::provider(&self.name, format!("input '{}' is not a string", field))
            })
    }
}

/// Trait for provider implementations.
///
/// A provider performs the remote create/read/update/delete for one type tag.
/// `apply` must be logically idempotent: invoking it again with the same
/// resolved inputs for the same resource name converges to the same remote
/// state (create if absent, update if different).
///
/// If the remote system reports a transient placeholder (an address that is
/// still "Pending"), the provider re-polls internally, see
/// [`poll_until`](crate::poll::poll_until), and only returns real values.
///
/// # Thread Safety
///
/// Providers must be `Send + Sync`; independent resources apply concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// The type tag this provider handles.
    fn type_tag(&self) -> &str;

    /// Get a human-readable description of the provider.
    fn description(&self) -> &str;

    /// Inputs and outputs for the type tag.
    fn schema(&self) -> ResourceSchema;

    /// Create or update the resource and return its outputs.
    async fn apply(&self, request: &ApplyRequest) -> CoreResult<Outputs>;

    /// Read an existing resource by id.
    ///
    /// Default: nothing can be read.
    async fn read(&self, id: &str) -> CoreResult<Outputs> {
        Err(CoreError::NotFound(id.to_string()))
    }
}

/// A declared resource, owned by its stack.
pub struct ResourceNode {
    pub(crate) id: ResourceId,
    pub(crate) name: String,
    pub(crate) type_tag: String,
    pub(crate) inputs: Inputs,
    pub(crate) options: ResourceOptions,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) outputs: BTreeMap<String, Deferred<Value>>,
    /// Settles when the node does; ordering-only edges wait on it.
    pub(crate) completion: Deferred<()>,
    /// Ordering-only dependencies, from options and later `depend_on` calls.
    pub(crate) ordering: BTreeSet<ResourceId>,
}

impl ResourceNode {
    pub(crate) fn new(
        id: ResourceId,
        name: String,
        type_tag: String,
        inputs: Inputs,
        options: ResourceOptions,
        provider: Arc<dyn Provider>,
        output_fields: &[String],
    ) -> Self {
        let outputs = output_fields
            .iter()
            .map(|field| (field.clone(), Deferred::owned_by(id)))
            .collect();
        let ordering = options.depends_on.iter().copied().collect();
        Self {
            id,
            name,
            type_tag,
            inputs,
            options,
            provider,
            outputs,
            completion: Deferred::owned_by(id),
            ordering,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    /// Resources this node depends on, through inputs or ordering edges.
    pub fn dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.inputs.provenance();
        deps.extend(self.ordering.iter().copied());
        deps.remove(&self.id);
        deps
    }

    pub fn handle(&self) -> ResourceRef {
        ResourceRef {
            id: self.id,
            name: self.name.clone(),
            type_tag: self.type_tag.clone(),
            outputs: self.outputs.clone(),
            completion: self.completion.clone(),
        }
    }

    /// Settle every output and the completion with one failure.
    pub(crate) fn fail_outputs(&self, error: &CoreError) {
        for output in self.outputs.values() {
            let _ = output.fail(error.clone());
        }
        let _ = self.completion.fail(error.clone());
    }
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_tag", &self.type_tag)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("ordering", &self.ordering)
            .finish()
    }
}

/// Handle to a declared resource, returned by declaration.
///
/// Outputs are pending until the stack runs, but can be chained immediately.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    id: ResourceId,
    name: String,
    type_tag: String,
    outputs: BTreeMap<String, Deferred<Value>>,
    completion: Deferred<()>,
}

impl ResourceRef {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// A declared output.
    pub fn output(&self, field: &str) -> CoreResult<Deferred<Value>> {
        self.outputs.get(field).cloned().ok_or_else(|| {
            CoreError::Declaration(format!(
                "{} '{}' has no output '{}'",
                self.type_tag, self.name, field
            ))
        })
    }

    /// Names of the declared outputs.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(|k| k.as_str())
    }

    /// Settles once the resource is settled, or fails with it.
    pub fn completion(&self) -> &Deferred<()> {
        &self.completion
    }
}
