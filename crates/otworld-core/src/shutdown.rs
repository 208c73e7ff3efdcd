//! Shutdown requests from inside the server or from the OS.
//!
//! A work item (for example an admin "shutdown" command) calls
//! [`ShutdownSignal::request`]; the launcher thread blocks in
//! [`ShutdownSignal::block_until_shutdown`] until that happens or the
//! process receives SIGINT/SIGTERM (Ctrl+C on Windows).

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::{info, warn};

/// Why the server is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// [`ShutdownSignal::request`] was called.
    Requested,
    /// The process received a termination signal.
    Signal,
}

/// Programmatic shutdown trigger shared across threads.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the server to shut down. Safe to call from any thread, any
    /// number of times.
    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::AcqRel) {
            info!("shutdown requested");
        }
        self.notify.notify_one();
    }

    /// Whether a shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolve once [`request`](Self::request) has been called.
    pub async fn requested(&self) {
        while !self.is_requested() {
            self.notify.notified().await;
        }
    }

    /// Resolve on a programmatic request or an OS termination signal.
    pub async fn wait(&self) -> ShutdownReason {
        tokio::select! {
            () = self.requested() => ShutdownReason::Requested,
            () = termination_signal() => ShutdownReason::Signal,
        }
    }

    /// Block the calling (non-async) thread until [`wait`](Self::wait)
    /// resolves.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the signal-handling runtime cannot be built.
    pub fn block_until_shutdown(&self) -> std::io::Result<ShutdownReason> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.wait()))
    }
}

/// Wait for SIGINT/SIGTERM (or Ctrl+C). If handlers cannot be installed,
/// never resolves, leaving programmatic requests as the only trigger.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "failed to install signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C");
    }
}
