//! Game server binary for otworld.
//!
//! # Startup Sequence
//!
//! 1. Parse the command line and initialize structured logging (tracing)
//! 2. Create the application context (dispatcher, scheduler, lifecycle)
//! 3. Wire the file-backed collaborators
//! 4. Run bootstrap on the dispatcher and wait for readiness
//! 5. Open the protocol listeners and enter `RUNNING`
//! 6. Wait for a shutdown request or SIGINT/SIGTERM
//! 7. Close listeners, join the scheduler, drain the dispatcher
//!
//! Any bootstrap failure exits non-zero before a listener is opened.

mod cli;
mod error;
mod launcher;
mod standalone;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use otworld_core::collaborators::{SharedServices, SharedWorld};
use otworld_core::{AppContext, Bootstrap};
use parking_lot::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::ServerError;
use crate::standalone::{LocalWorld, TcpServiceRegistry};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    match run(&cli) {
        Ok(()) => {
            info!("otworld-server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "otworld-server failed");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    let fallback = cli.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: &Cli) -> Result<(), ServerError> {
    // 2. Application context.
    let ctx = AppContext::new();

    // 3. Collaborators. The launcher keeps the service handle.
    let world: SharedWorld = Arc::new(Mutex::new(LocalWorld::default()));
    let services: SharedServices = Arc::new(Mutex::new(TcpServiceRegistry::new()));
    let collaborators = standalone::collaborators(
        Box::new(cli.config_source()),
        world,
        Arc::clone(&services),
    );

    // 4. Bootstrap. Failure has already stopped both threads.
    let report = Bootstrap::new(collaborators).run(&ctx)?;

    // 5-7. Listeners, shutdown wait, drain.
    launcher::serve(&ctx, &services, &report)
}
