//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use stratus_lab::Topology;

pub mod plan;
pub mod up;

/// stratus-lab - provision lab topologies against a simulated cloud
#[derive(Parser)]
#[command(name = "stratus-lab")]
#[command(version, about = "Provision Kubernetes lab topologies against a simulated cloud")]
#[command(long_about = r#"
Declares one of the lab topologies on a stack and provisions it in dependency
order. Outputs of one resource (ids, credentials, load balancer addresses)
feed the inputs of the next.

COMMANDS:
  plan  → Show the resources and the order they would be provisioned in
  up    → Provision the topology and print its exports

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or settings
  3 - Declaration failure
  4 - Provisioning failure
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable debug output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Provision a topology
    Up(up::UpArgs),

    /// Show the provisioning order of a topology
    Plan(plan::PlanArgs),
}

/// Arguments selecting and configuring a topology.
#[derive(Args)]
pub struct TopologyArgs {
    /// Lab topology to declare
    #[arg(short, long, value_enum, default_value_t = Topology::Aks)]
    pub topology: Topology,

    /// Topology settings file (.json, .yaml or .yml)
    #[arg(short, long, env = "STRATUS_LAB_CONFIG")]
    pub config: Option<PathBuf>,
}
