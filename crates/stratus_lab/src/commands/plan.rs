//! Plan command - Show the provisioning order of a topology.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use stratus_core::Stack;
use stratus_lab::{declare_topology, simulated_registry, SimulatedCloud};

use super::TopologyArgs;

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    topology: TopologyArgs,
}

pub async fn execute(args: PlanArgs) -> Result<()> {
    let topology = args.topology.topology;
    info!("Planning {} topology", topology);

    let cloud = SimulatedCloud::new();
    let mut stack = Stack::new(topology.stack_name(), Arc::new(simulated_registry(&cloud)));
    declare_topology(&mut stack, topology, args.topology.config.as_deref(), None)
        .context("Topology declaration failed")?;

    let plan = stack.plan()?;
    println!("Stack '{}': {} resources", stack.name(), plan.len());
    for (number, step) in plan.iter().enumerate() {
        let mut line = format!("  {:>2}. {} ({})", number + 1, step.resource, step.type_tag);
        if !step.after.is_empty() {
            line.push_str(&format!(" after {}", step.after.join(", ")));
        }
        if step.downstream > 0 {
            line.push_str(&format!(
                "; needed by {} ({} downstream)",
                step.needed_by.join(", "),
                step.downstream
            ));
        }
        println!("{}", line);
    }

    Ok(())
}
