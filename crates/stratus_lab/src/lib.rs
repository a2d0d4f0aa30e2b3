//! # stratus_lab
//!
//! Kubernetes lab environments declared on a [`stratus_core::Stack`], and a
//! simulated cloud to run them against.
//!
//! # Topologies
//!
//! - **AKS**: resource group, virtual network and subnet, managed cluster,
//!   Traefik via Helm and the application behind an ingress whose host is
//!   derived from the Traefik load balancer address
//! - **EKS**: cluster and managed node group, application behind a
//!   LoadBalancer service; the kubeconfig can be written to a file
//! - **Rancher**: application and ingress on an existing cluster
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratus_core::Stack;
//! use stratus_lab::{declare_aks, simulated_registry, LabConfig, SimulatedCloud};
//!
//! let cloud = SimulatedCloud::new();
//! let mut stack = Stack::new("aks-lab", Arc::new(simulated_registry(&cloud)));
//! declare_aks(&mut stack, &LabConfig::default(), None)?;
//!
//! let report = stack.run().await?;
//! println!("{}", report.export("ingressUrl").unwrap());
//! ```

pub mod config;
pub mod error;
pub mod providers;
pub mod topology;

pub use config::{run_config_from_file, EksConfig, LabConfig, RancherConfig};
pub use error::{LabError, LabResult};
pub use providers::{
    simulated_registry, CapturedCall, ResourceKind, SimulatedCloud, SimulatedProvider,
    StoredResource,
};
pub use topology::{
    declare_aks, declare_eks, declare_rancher, declare_topology, AksLab, EksLab, RancherLab,
    Topology,
};
