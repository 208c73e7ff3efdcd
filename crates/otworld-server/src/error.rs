//! Error types for the server binary.
//!
//! [`ServerError`] wraps every failure `main` can see after logging is up,
//! so the launcher can propagate with `?` and map to an exit code once.

use otworld_core::BootstrapError;
use otworld_core::lifecycle::LifecycleError;

/// Top-level error for the server binary.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Startup failed before readiness.
    #[error("bootstrap error: {source}")]
    Bootstrap {
        /// The underlying bootstrap error.
        #[from]
        source: BootstrapError,
    },

    /// A lifecycle edge was refused.
    #[error("lifecycle error: {source}")]
    Lifecycle {
        /// The underlying lifecycle error.
        #[from]
        source: LifecycleError,
    },

    /// Listeners could not be started.
    #[error("service error: {message}")]
    Services {
        /// Description of the failure.
        message: String,
    },

    /// The shutdown signal runtime could not be created.
    #[error("signal handling error: {source}")]
    Signals {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}
