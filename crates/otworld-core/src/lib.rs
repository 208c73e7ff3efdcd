//! Serial dispatch, timed scheduling and startup sequencing for the
//! otworld game server.
//!
//! All world mutation happens on one dispatcher thread. Network handlers
//! and the scheduler are producers: they hand [`Task`]s to the
//! [`Dispatcher`], which runs them one at a time in submission order.
//! Startup itself is a single task that loads everything, registers
//! periodic maintenance with the [`Scheduler`], and then opens the
//! readiness latch.
//!
//! # Modules
//!
//! - [`task`] -- [`Task`] work items and [`RepeatingJob`] for periodic events.
//! - [`dispatcher`] -- Single-consumer serial executor with failure isolation.
//! - [`timer_heap`] -- Deadline-ordered event store with cancellation handles.
//! - [`scheduler`] -- Timer thread that releases due events to the dispatcher.
//! - [`latch`] -- One-shot readiness signal.
//! - [`lifecycle`] -- Process state machine owning the readiness latch.
//! - [`shutdown`] -- Programmatic and OS-signal shutdown trigger.
//! - [`config`] -- Configuration loading from `otworld-config.yaml`.
//! - [`rules`] -- World type, password type, game state and protocols.
//! - [`collaborators`] -- Traits for persistence, loaders, world, services.
//! - [`server_save`] -- Daily server-save timing.
//! - [`network`] -- Server address set and address resolution.
//! - [`bootstrap`] -- [`AppContext`] and the startup sequence.
//!
//! [`Task`]: task::Task
//! [`RepeatingJob`]: task::RepeatingJob
//! [`Dispatcher`]: dispatcher::Dispatcher
//! [`Scheduler`]: scheduler::Scheduler
//! [`AppContext`]: bootstrap::AppContext

pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod latch;
pub mod lifecycle;
pub mod network;
pub mod rules;
pub mod scheduler;
pub mod server_save;
pub mod shutdown;
pub mod task;
pub mod timer_heap;

pub use bootstrap::{AppContext, BootReport, Bootstrap, BootstrapError};
pub use dispatcher::Dispatcher;
pub use scheduler::Scheduler;
pub use task::{RepeatingJob, Task};
