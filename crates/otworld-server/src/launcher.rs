//! Everything the launcher thread does after bootstrap has reported.
//!
//! ```text
//!   wait READY -> services.run(addresses) -> RUNNING
//!              -> block until shutdown request or signal
//!              -> services.stop() -> DRAINING -> join scheduler, dispatcher -> STOPPED
//! ```
//!
//! The listeners are stopped before the lifecycle leaves `RUNNING`, so no
//! new network work is produced while the dispatcher drains.

use otworld_core::collaborators::SharedServices;
use otworld_core::lifecycle::ProcessState;
use otworld_core::{AppContext, BootReport};
use tracing::{info, warn};

use crate::error::ServerError;

/// Serve from readiness until shutdown, then drain.
///
/// Returns `Ok` without opening anything when no service is registered.
///
/// # Errors
///
/// Returns [`ServerError::Services`] if listeners cannot be started (the
/// context is drained first), or the error of the shutdown wait.
pub fn serve(
    ctx: &AppContext,
    services: &SharedServices,
    report: &BootReport,
) -> Result<(), ServerError> {
    ctx.lifecycle().readiness().wait();
    info!(
        server = %report.config.server.name,
        world_type = %report.world_type,
        password_type = %report.password_type,
        services = report.services.len(),
        "server ready"
    );

    if !services.lock().is_running() {
        warn!("no services running, the server is not online");
        ctx.drain()?;
        return Ok(());
    }
    let started = services.lock().run(&report.addresses);
    if let Err(e) = started {
        services.lock().stop();
        ctx.drain()?;
        return Err(ServerError::Services {
            message: e.to_string(),
        });
    }
    ctx.lifecycle().transition(ProcessState::Running)?;
    info!(
        server = %report.config.server.name,
        public = ?report.addresses.public(),
        "server online"
    );

    let reason = ctx.shutdown().block_until_shutdown();

    // Ordered shutdown, even if the signal runtime failed.
    services.lock().stop();
    ctx.drain()?;
    info!(reason = ?reason.as_ref().ok(), "shutdown complete");
    reason?;
    Ok(())
}
