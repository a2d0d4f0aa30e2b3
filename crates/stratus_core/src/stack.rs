//! Stacks: declared resources plus named exports.
//!
//! Declaring never executes anything. It validates the inputs against the
//! provider schema, derives dependency edges from the provenance of every
//! deferred value embedded in the inputs, and hands back a [`ResourceRef`]
//! whose outputs can be chained immediately. [`Stack::run`] then drives the
//! whole graph to completion.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::deferred::Deferred;
use crate::error::{CoreError, CoreResult};
use crate::export::ExportSink;
use crate::graph::{DependencyGraph, EdgeKind};
use crate::input::Inputs;
use crate::options::ResourceOptions;
use crate::registry::ProviderRegistry;
use crate::report::{ExecutionState, NodeFailure, RunReport};
use crate::resource::{NodeState, Outputs, ResourceId, ResourceNode, ResourceRef};
use crate::scheduler::{CancelHandle, Scheduler};

/// One resource in a [`Stack::plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub resource: String,
    pub type_tag: String,
    /// Direct dependencies, data and ordering alike
    pub after: Vec<String>,
    /// Direct dependents
    pub needed_by: Vec<String>,
    /// Resources that fail if this one fails
    pub downstream: usize,
}

/// One deployable unit of infrastructure.
pub struct Stack {
    id: Uuid,
    name: String,
    registry: Arc<ProviderRegistry>,
    config: RunConfig,
    nodes: Vec<ResourceNode>,
    by_name: HashMap<String, ResourceId>,
    graph: DependencyGraph,
    exports: BTreeMap<String, Deferred<Value>>,
    sinks: Vec<(String, Arc<dyn ExportSink>)>,
    declaration_errors: Vec<CoreError>,
    cancel: CancelHandle,
}

impl Stack {
    pub fn new(name: impl Into<String>, registry: Arc<ProviderRegistry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            registry,
            config: RunConfig::default(),
            nodes: Vec::new(),
            by_name: HashMap::new(),
            graph: DependencyGraph::new(),
            exports: BTreeMap::new(),
            sinks: Vec::new(),
            declaration_errors: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity carried by every [`ResourceId`] this stack hands out.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Handle to a declared resource by name.
    pub fn resource(&self, name: &str) -> Option<ResourceRef> {
        self.by_name
            .get(name)
            .and_then(|id| self.nodes.get(id.index()))
            .map(ResourceNode::handle)
    }

    /// Declared resources in an order where every dependency comes first.
    pub fn execution_order(&self) -> CoreResult<Vec<ResourceRef>> {
        Ok(self
            .graph
            .topological_order()?
            .into_iter()
            .filter_map(|id| self.nodes.get(id.index()))
            .map(ResourceNode::handle)
            .collect())
    }

    /// The execution order with each resource's neighbours named.
    pub fn plan(&self) -> CoreResult<Vec<PlanStep>> {
        let names = |ids: BTreeSet<ResourceId>| -> Vec<String> {
            ids.into_iter()
                .filter_map(|id| self.nodes.get(id.index()))
                .map(|node| node.name.clone())
                .collect()
        };
        Ok(self
            .execution_order()?
            .into_iter()
            .map(|resource| PlanStep {
                after: names(self.graph.dependencies(resource.id())),
                needed_by: names(self.graph.dependents(resource.id())),
                downstream: self.graph.transitive_dependents(resource.id()).len(),
                resource: resource.name().to_string(),
                type_tag: resource.type_tag().to_string(),
            })
            .collect())
    }

    /// Errors recorded by failed declarations.
    pub fn declaration_errors(&self) -> &[CoreError] {
        &self.declaration_errors
    }

    /// Handle that cancels this stack's run, usable from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Declare a resource with default options.
    pub fn declare(
        &mut self,
        type_tag: &str,
        name: impl Into<String>,
        inputs: Inputs,
    ) -> CoreResult<ResourceRef> {
        self.declare_with(type_tag, name, inputs, ResourceOptions::default())
    }

    /// Declare a resource.
    ///
    /// A failed declaration is also recorded on the stack, and [`Stack::run`]
    /// refuses to start while any are recorded.
    pub fn declare_with(
        &mut self,
        type_tag: &str,
        name: impl Into<String>,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> CoreResult<ResourceRef> {
        let name = name.into();
        self.try_declare(type_tag, &name, inputs, options)
            .map_err(|err| self.record(err))
    }

    fn try_declare(
        &mut self,
        type_tag: &str,
        name: &str,
        inputs: Inputs,
        options: ResourceOptions,
    ) -> CoreResult<ResourceRef> {
        if self.by_name.contains_key(name) {
            return Err(CoreError::Declaration(format!(
                "resource '{}' is already declared",
                name
            )));
        }

        let provider = self.registry.get_required(type_tag)?;
        let schema = provider.schema();
        schema.validate(type_tag, name, &inputs)?;

        let data = inputs.provenance();
        for dep in data.iter().chain(options.depends_on.iter()) {
            if !self.contains(*dep) {
                return Err(CoreError::Declaration(format!(
                    "{} '{}' references resource {} outside stack '{}'",
                    type_tag, name, dep, self.name
                )));
            }
        }

        let id = ResourceId::new(self.id, self.nodes.len());
        self.graph.add_node(id);
        for dep in &data {
            self.graph.try_add_edge(*dep, id, EdgeKind::Data)?;
        }
        for dep in &options.depends_on {
            self.graph.try_add_edge(*dep, id, EdgeKind::Ordering)?;
        }

        let node = ResourceNode::new(
            id,
            name.to_string(),
            type_tag.to_string(),
            inputs,
            options,
            provider,
            &schema.outputs,
        );
        debug!(
            "Declared {} '{}' with {} dependencies",
            type_tag,
            name,
            node.dependencies().len()
        );
        let handle = node.handle();
        self.nodes.push(node);
        self.by_name.insert(name.to_string(), id);
        Ok(handle)
    }

    /// Add an ordering edge after both resources were declared.
    ///
    /// An edge that would close a cycle is refused and recorded, so the stack
    /// will not run.
    pub fn depend_on(&mut self, dependent: &ResourceRef, dependency: &ResourceRef) -> CoreResult<()> {
        let linked = self
            .owns(dependent)
            .and_then(|_| self.owns(dependency));
        if let Err(err) = linked.and_then(|_| {
            self.graph
                .try_add_edge(dependency.id(), dependent.id(), EdgeKind::Ordering)
        }) {
            return Err(self.record(err));
        }

        if let Some(node) = self.nodes.get_mut(dependent.id().index()) {
            node.ordering.insert(dependency.id());
        }
        debug!("'{}' now depends on '{}'", dependent.name(), dependency.name());
        Ok(())
    }

    fn contains(&self, id: ResourceId) -> bool {
        id.stack() == self.id && id.index() < self.nodes.len()
    }

    fn owns(&self, resource: &ResourceRef) -> CoreResult<()> {
        match self.nodes.get(resource.id().index()) {
            Some(node) if node.id == resource.id() && node.name == resource.name() => Ok(()),
            _ => Err(CoreError::Declaration(format!(
                "resource '{}' is not declared in stack '{}'",
                resource.name(),
                self.name
            ))),
        }
    }

    /// Publish a named value from the stack.
    pub fn export(&mut self, name: impl Into<String>, value: Deferred<Value>) -> CoreResult<()> {
        let name = name.into();
        if self.exports.contains_key(&name) {
            let err = CoreError::Declaration(format!("export '{}' is already declared", name));
            return Err(self.record(err));
        }
        if let Some(foreign) = value.provenance().iter().find(|id| !self.contains(**id)) {
            let err = CoreError::Declaration(format!(
                "export '{}' references resource {} outside stack '{}'",
                name, foreign, self.name
            ));
            return Err(self.record(err));
        }
        debug!("Declared export '{}'", name);
        self.exports.insert(name, value);
        Ok(())
    }

    /// Publish a named value and persist it to `sink` once it has resolved.
    pub fn export_to(
        &mut self,
        name: impl Into<String>,
        value: Deferred<Value>,
        sink: Arc<dyn ExportSink>,
    ) -> CoreResult<()> {
        let name = name.into();
        self.export(name.clone(), value)?;
        self.sinks.push((name, sink));
        Ok(())
    }

    /// Read an existing resource through the provider for its type.
    pub async fn read(&self, type_tag: &str, id: &str) -> CoreResult<Outputs> {
        let provider = self.registry.get_required(type_tag)?;
        provider.read(id).await
    }

    fn record(&mut self, err: CoreError) -> CoreError {
        error!("Declaration failed in stack '{}': {}", self.name, err);
        self.declaration_errors.push(err.clone());
        err
    }

    /// Execute every declared resource and collect the exports.
    ///
    /// Returns an error only when declaration failed; execution failures are
    /// reported per node in the [`RunReport`].
    pub async fn run(self) -> CoreResult<RunReport> {
        match self.declaration_errors.as_slice() {
            [] => {}
            [only] => return Err(only.clone()),
            many => {
                let messages: Vec<String> = many.iter().map(|e| e.to_string()).collect();
                return Err(CoreError::Declaration(messages.join("; ")));
            }
        }
        DependencyGraph::from_nodes(&self.nodes)?.topological_order()?;

        let mut report = RunReport::new(&self.name);
        report.state = ExecutionState::Running;
        info!(
            "Running stack '{}' ({} resources, {} edges, {} exports)",
            self.name,
            self.nodes.len(),
            self.graph.edge_count(),
            self.exports.len()
        );

        let scheduler = Scheduler::new(&self.nodes, &self.config, self.cancel.clone());
        report.nodes = scheduler.run().await;

        for node in &report.nodes {
            if let (NodeState::Failed, Some(error)) = (node.state, &node.error) {
                report.errors.push(NodeFailure {
                    resource: node.name.clone(),
                    type_tag: node.type_tag.clone(),
                    error: error.clone(),
                });
            }
        }

        for (name, value) in &self.exports {
            match value.peek() {
                Some(Ok(value)) => {
                    report.exports.insert(name.clone(), value);
                }
                Some(Err(err)) => {
                    warn!("Export '{}' failed: {}", name, err);
                    report.unresolved_exports.insert(name.clone(), err);
                }
                None => {
                    warn!("Export '{}' never settled", name);
                    report
                        .unresolved_exports
                        .insert(name.clone(), CoreError::Unresolved(format!("export '{}'", name)));
                }
            }
        }

        for (name, sink) in &self.sinks {
            let Some(value) = report.exports.get(name) else {
                debug!("Skipping sink for unresolved export '{}'", name);
                continue;
            };
            if let Err(err) = sink.write(name, value).await {
                error!("Could not persist export '{}': {}", name, err);
                report.sink_errors.insert(name.clone(), err);
            }
        }

        report.state = if report.count(NodeState::Cancelled) > 0 {
            ExecutionState::Cancelled
        } else if report.errors.is_empty()
            && report.unresolved_exports.is_empty()
            && report.sink_errors.is_empty()
        {
            ExecutionState::Completed
        } else {
            ExecutionState::Failed
        };
        report.completed_at = Some(Utc::now());

        match report.state {
            ExecutionState::Completed => info!("Stack '{}' completed", self.name),
            state => error!(
                "Stack '{}' finished {:?}: {} failed resources, {} unresolved exports",
                self.name,
                state,
                report.errors.len(),
                report.unresolved_exports.len()
            ),
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{MockProvider, ResourceSchema};
    use serde_json::json;

    fn registry() -> Arc<ProviderRegistry> {
        let mut network = MockProvider::new();
        network
            .expect_schema()
            .returning(|| ResourceSchema::new().require("addressSpace").output("id"));
        let mut subnet = MockProvider::new();
        subnet.expect_schema().returning(|| {
            ResourceSchema::new()
                .require("vnetId")
                .optional("prefix")
                .output("id")
        });

        let mut registry = ProviderRegistry::new();
        registry.register_as("network", Arc::new(network));
        registry.register_as("subnet", Arc::new(subnet));
        Arc::new(registry)
    }

    #[test]
    fn test_declare_derives_data_edges() {
        let mut stack = Stack::new("lab", registry());
        let vnet = stack
            .declare("network", "vnet", Inputs::new().field("addressSpace", "10.0.0.0/8"))
            .unwrap();
        let subnet = stack
            .declare(
                "subnet",
                "subnet",
                Inputs::new().field("vnetId", vnet.output("id").unwrap()),
            )
            .unwrap();

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.graph().edge(vnet.id(), subnet.id()), Some(EdgeKind::Data));
        assert_eq!(stack.resource("subnet").unwrap().id(), subnet.id());
        assert!(subnet.output("id").unwrap().peek().is_none());
    }

    #[test]
    fn test_execution_order_puts_dependencies_first() {
        let mut stack = Stack::new("lab", registry());
        let vnet = stack
            .declare("network", "vnet", Inputs::new().field("addressSpace", "10.0.0.0/8"))
            .unwrap();
        let subnet = stack
            .declare(
                "subnet",
                "subnet",
                Inputs::new().field("vnetId", vnet.output("id").unwrap()),
            )
            .unwrap();
        let other = stack
            .declare("network", "peer", Inputs::new().field("addressSpace", "10.1.0.0/16"))
            .unwrap();
        stack.depend_on(&vnet, &other).unwrap();

        let order: Vec<String> = stack
            .execution_order()
            .unwrap()
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();

        assert_eq!(order.len(), 3);
        assert!(position("peer") < position("vnet"));
        assert!(position("vnet") < position(subnet.name()));
    }

    #[test]
    fn test_declaration_errors_are_recorded() {
        let mut stack = Stack::new("lab", registry());
        stack
            .declare("network", "vnet", Inputs::new().field("addressSpace", "10.0.0.0/8"))
            .unwrap();

        let duplicate =
            stack.declare("network", "vnet", Inputs::new().field("addressSpace", "10.1.0.0/16"));
        let unknown_type = stack.declare("dns-zone", "zone", Inputs::new());
        let missing_input = stack.declare("subnet", "subnet", Inputs::new());

        assert!(duplicate.is_err());
        assert!(unknown_type.is_err());
        assert!(missing_input.is_err());
        assert_eq!(stack.declaration_errors().len(), 3);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_depend_on_refuses_cycles() {
        let mut stack = Stack::new("lab", registry());
        let a = stack
            .declare("network", "a", Inputs::new().field("addressSpace", "10.0.0.0/8"))
            .unwrap();
        let b = stack
            .declare("subnet", "b", Inputs::new().field("vnetId", a.output("id").unwrap()))
            .unwrap();

        let err = stack.depend_on(&a, &b).unwrap_err();
        assert!(matches!(err, CoreError::Declaration(_)));
        assert_eq!(stack.declaration_errors().len(), 1);
    }

    #[test]
    fn test_duplicate_export_is_rejected() {
        let mut stack = Stack::new("lab", registry());
        stack.export("location", Deferred::resolved(json!("eastus"))).unwrap();

        assert!(stack
            .export("location", Deferred::resolved(json!("westus")))
            .is_err());
    }

    #[tokio::test]
    async fn test_read_uses_registered_provider() {
        let mut network = MockProvider::new();
        network
            .expect_read()
            .withf(|id| id.to_string() == "/vnets/lab-vnet")
            .returning(|_| Ok(Outputs::from_iter([("id".to_string(), json!("/vnets/lab-vnet"))])));
        let mut registry = ProviderRegistry::new();
        registry.register_as("network", Arc::new(network));
        let stack = Stack::new("lab", Arc::new(registry));

        let outputs = stack.read("network", "/vnets/lab-vnet").await.unwrap();
        assert_eq!(outputs["id"], json!("/vnets/lab-vnet"));
        assert!(stack.read("cluster", "aks").await.is_err());
    }
}
