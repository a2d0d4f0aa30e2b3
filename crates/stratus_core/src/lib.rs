//! # stratus_core
//!
//! Dependency resolution and deferred-value propagation for declarative
//! infrastructure.
//!
//! Resources are declared against a [`Stack`] before anything exists. Their
//! outputs (ids, addresses, credentials) are [`Deferred`] values that can be
//! fed straight into the inputs of other resources. Running the stack invokes
//! each resource's [`Provider`] as soon as its inputs have settled, and
//! independent resources are provisioned concurrently.
//!
//! # Architecture
//!
//! - **Deferred**: a value that settles exactly once, with combinators
//! - **Stack**: declared resources, their dependency graph and the exports
//! - **Registry**: maps resource type tags to provider implementations
//! - **Scheduler**: settlement-driven execution in dependency order
//! - **Export sinks**: durable destinations written only with resolved values
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_core::{Inputs, ProviderRegistry, Stack};
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(NetworkProvider));
//! registry.register(Arc::new(SubnetProvider));
//!
//! let mut stack = Stack::new("lab", Arc::new(registry));
//! let vnet = stack.declare("network", "vnet", Inputs::new().field("addressSpace", "10.0.0.0/8"))?;
//! let subnet = stack.declare(
//!     "subnet",
//!     "subnet",
//!     Inputs::new().field("vnetName", vnet.output("name")?),
//! )?;
//! stack.export("subnetId", subnet.output("id")?)?;
//!
//! let report = stack.run().await?;
//! ```

pub mod config;
pub mod deferred;
pub mod error;
pub mod export;
pub mod graph;
pub mod input;
pub mod options;
pub mod poll;
pub mod registry;
pub mod report;
pub mod resource;
pub mod scheduler;
pub mod stack;

// Re-export main types for convenience
pub use config::RunConfig;
pub use deferred::{interpolate, Deferred};
pub use error::{CoreError, CoreResult};
pub use export::{ExportSink, FileSink, MemorySink};
pub use graph::{DependencyGraph, EdgeKind};
pub use input::{Input, Inputs};
pub use options::{Backoff, ResourceOptions, RetryPolicy};
pub use poll::{poll_until, PollConfig, Probe};
pub use registry::ProviderRegistry;
pub use report::{ExecutionState, NodeFailure, NodeReport, RunReport};
pub use resource::{
    ApplyRequest, NodeState, Outputs, Provider, ResourceId, ResourceNode, ResourceRef,
    ResourceSchema,
};
pub use scheduler::CancelHandle;
pub use stack::{PlanStep, Stack};
