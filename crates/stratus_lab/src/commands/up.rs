//! Up command - Provision a topology.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use stratus_core::{ExecutionState, NodeState, RunConfig, Stack};
use stratus_lab::{declare_topology, run_config_from_file, simulated_registry, SimulatedCloud};

use super::TopologyArgs;

#[derive(Args)]
pub struct UpArgs {
    #[command(flatten)]
    topology: TopologyArgs,

    /// Engine settings file (timeouts, concurrency, retries)
    #[arg(long)]
    run_config: Option<PathBuf>,

    /// Maximum concurrent provider calls (0 = unbounded)
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Write the cluster kubeconfig here once it is known
    #[arg(long)]
    kubeconfig_out: Option<PathBuf>,

    /// Save the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Polls a new load balancer answers with "Pending"
    #[arg(long, default_value_t = 2)]
    pending_polls: u32,
}

pub async fn execute(args: UpArgs) -> Result<()> {
    let topology = args.topology.topology;

    let mut config = match &args.run_config {
        Some(path) => run_config_from_file(path)
            .with_context(|| format!("Invalid run config {:?}", path))?,
        None => RunConfig::default(),
    };
    if let Some(limit) = args.max_concurrency {
        config = config.max_concurrency(limit);
    }

    let cloud = SimulatedCloud::new().with_pending_polls(args.pending_polls);
    let mut stack = Stack::new(topology.stack_name(), Arc::new(simulated_registry(&cloud)))
        .with_config(config);
    declare_topology(
        &mut stack,
        topology,
        args.topology.config.as_deref(),
        args.kubeconfig_out.as_deref(),
    )
    .context("Topology declaration failed")?;

    let cancel = stack.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    info!("Provisioning {} topology", topology);
    let report = stack.run().await?;

    if let Some(path) = &args.report {
        report.save(path)?;
        info!("Run report written to {:?}", path);
    }

    println!(
        "Stack '{}' {:?}: {} settled, {} failed, {} cancelled",
        report.stack,
        report.state,
        report.count(NodeState::Settled),
        report.count(NodeState::Failed),
        report.count(NodeState::Cancelled)
    );
    for (name, value) in &report.exports {
        match value.as_str() {
            Some(text) if text.contains('\n') => println!("  {}: <{} lines>", name, text.lines().count()),
            Some(text) => println!("  {}: {}", name, text),
            None => println!("  {}: {}", name, value),
        }
    }
    for failure in report.root_failures() {
        println!("  ✗ {} ({}): {}", failure.resource, failure.type_tag, failure.error);
    }
    for (name, err) in &report.unresolved_exports {
        println!("  ? {}: {}", name, err);
    }

    match report.state {
        ExecutionState::Completed => Ok(()),
        ExecutionState::Cancelled => anyhow::bail!("Provisioning was cancelled"),
        _ => anyhow::bail!(
            "Provisioning failed: {} resources failed, {} exports unresolved",
            report.errors.len(),
            report.unresolved_exports.len()
        ),
    }
}
