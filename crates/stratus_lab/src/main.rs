//! stratus-lab CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or settings
//! - 3: Declaration failure
//! - 4: Provisioning failure

use std::process::ExitCode;

use clap::Parser;
use stratus_core::CoreError;
use stratus_lab::LabError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const DECLARATION_FAILURE: u8 = 3;
    pub const PROVISION_FAILURE: u8 = 4;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "stratus=debug" } else { "stratus=info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in [default_level, "warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    // Ignore the error if a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();

    let result = match cli.command {
        Commands::Up(args) => commands::up::execute(args).await,
        Commands::Plan(args) => commands::plan::execute(args).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
///
/// Typed errors anywhere in the chain decide first; bare messages from the
/// commands fall back to their wording.
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<LabError>() {
            return match err {
                LabError::Core(core) => categorize_core(core),
                _ => ExitCodes::INVALID_ARGS,
            };
        }
        if let Some(core) = cause.downcast_ref::<CoreError>() {
            return categorize_core(core);
        }
    }

    let msg = format!("{:#}", e).to_lowercase();
    if msg.contains("provision") {
        ExitCodes::PROVISION_FAILURE
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

fn categorize_core(err: &CoreError) -> u8 {
    match err {
        CoreError::Declaration(_) => ExitCodes::DECLARATION_FAILURE,
        _ => ExitCodes::GENERAL_ERROR,
    }
}
