//! Startup sequence and the owned service set.
//!
//! # Architecture
//!
//! ```text
//!   launcher thread                       dispatcher thread
//!   ---------------                       -----------------
//!   lifecycle -> BOOTSTRAPPING
//!   create oneshot (tx, rx)
//!   submit "bootstrap" task ------------>
//!   start dispatcher + scheduler          1. load configuration
//!   rx.blocking_recv() ...                2. install keys
//!                                         3. database: connect, migrate, check
//!                                         4. static data loaders, in order
//!                                         5. script systems
//!                                         6. world type
//!                                         7. map
//!                                         8. register protocol services
//!                                         9. autosave + server save events
//!                                        10. housekeeping
//!                                        11. server addresses
//!                                        12. world start, lifecycle -> READY
//!                                            (fires the readiness latch)
//!        <------------------------------- tx.send(Ok(report))
//! ```
//!
//! The whole sequence is a single dispatcher work item, so anything it
//! populates is owned by the same thread that later runs request work.
//! The outcome channel exists before either thread is started, so a
//! bootstrap that finishes instantly cannot be missed.
//!
//! On any error the task reports it without touching the lifecycle; the
//! readiness latch is never opened on a failure path. [`Bootstrap::run`]
//! then moves the lifecycle to `STOPPED` and joins both threads.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::collaborators::{
    CollaboratorError, Collaborators, Housekeeping, Persistence, SharedWorld,
};
use crate::config::{ConfigError, ServerConfig};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::lifecycle::{Lifecycle, LifecycleError, ProcessState};
use crate::network::ServerAddresses;
use crate::rules::{GameState, PasswordType, Protocol, ServiceBinding, WorldType};
use crate::scheduler::{Scheduler, SchedulingError};
use crate::server_save;
use crate::shutdown::ShutdownSignal;
use crate::task::{RepeatingJob, Task};
use crate::timer_heap::EventId;

/// Label of the bootstrap work item.
pub const BOOTSTRAP_TASK: &str = "bootstrap";

const ONE_DAY: Duration = Duration::from_secs(86_400);

/// Errors that abort startup.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Configuration could not be loaded.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// A configuration value was loaded but cannot be used.
    #[error("configuration error: {reason}")]
    Configuration {
        /// What is wrong, naming the offending value.
        reason: String,
    },

    /// A required external resource failed.
    #[error("{step} failed: {source}")]
    ResourceUnavailable {
        /// The startup step that failed.
        step: String,
        /// The collaborator's error.
        source: CollaboratorError,
    },

    /// The bootstrap task could not be queued.
    #[error("dispatcher error: {source}")]
    Dispatch {
        /// The underlying dispatcher error.
        #[from]
        source: DispatchError,
    },

    /// Maintenance events could not be scheduled.
    #[error("scheduler error: {source}")]
    Scheduling {
        /// The underlying scheduler error.
        #[from]
        source: SchedulingError,
    },

    /// The lifecycle was not in a state that allows bootstrapping.
    #[error("lifecycle error: {source}")]
    Lifecycle {
        /// The underlying lifecycle error.
        #[from]
        source: LifecycleError,
    },

    /// The bootstrap task ended without reporting an outcome.
    #[error("bootstrap task aborted before reporting an outcome")]
    Aborted,
}

impl BootstrapError {
    fn resource(step: impl Into<String>, source: CollaboratorError) -> Self {
        Self::ResourceUnavailable {
            step: step.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Application context
// ---------------------------------------------------------------------------

/// The explicitly owned service set: one dispatcher, one scheduler, the
/// lifecycle and the shutdown trigger.
#[derive(Debug)]
pub struct AppContext {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    lifecycle: Arc<Lifecycle>,
    shutdown: Arc<ShutdownSignal>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    /// Create the services. No thread is started yet.
    pub fn new() -> Self {
        let dispatcher = Arc::new(Dispatcher::new());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&dispatcher)));
        Self {
            dispatcher,
            scheduler,
            lifecycle: Arc::new(Lifecycle::new()),
            shutdown: Arc::new(ShutdownSignal::new()),
        }
    }

    /// The serial executor.
    pub const fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The timer scheduler.
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Process state and readiness latch.
    pub const fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Shutdown trigger.
    pub const fn shutdown(&self) -> &Arc<ShutdownSignal> {
        &self.shutdown
    }

    /// Start the dispatcher, then the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if either thread cannot be spawned.
    pub fn start(&self) -> Result<(), BootstrapError> {
        self.dispatcher.start()?;
        self.scheduler.start()?;
        Ok(())
    }

    /// Orderly shutdown from `READY` or `RUNNING`: scheduler first, then
    /// the dispatcher drains its queue.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError`] if the process is not in a drainable
    /// state; nothing is joined in that case.
    pub fn drain(&self) -> Result<(), LifecycleError> {
        self.lifecycle.transition(ProcessState::Draining)?;
        self.scheduler.join();
        self.dispatcher.join();
        self.lifecycle.transition(ProcessState::Stopped)?;
        info!(
            executed = self.dispatcher.stats().executed(),
            failed = self.dispatcher.stats().failed(),
            panicked = self.dispatcher.stats().panicked(),
            "drained"
        );
        Ok(())
    }

    /// Tear down after a failed bootstrap. The latch stays closed.
    fn abort(&self) {
        if let Err(e) = self.lifecycle.transition(ProcessState::Stopped) {
            warn!(error = %e, "abort from unexpected state");
        }
        self.scheduler.join();
        self.dispatcher.join();
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// What a successful bootstrap produced.
#[derive(Debug, Clone)]
pub struct BootReport {
    /// The loaded configuration.
    pub config: ServerConfig,
    /// Resolved PvP ruleset.
    pub world_type: WorldType,
    /// Resolved password hashing mode.
    pub password_type: PasswordType,
    /// Registered protocol services.
    pub services: Vec<ServiceBinding>,
    /// Server address set.
    pub addresses: ServerAddresses,
    /// Autosave event, when enabled.
    pub autosave: Option<EventId>,
    /// Daily server-save event, when enabled and the hour is valid.
    pub server_save: Option<EventId>,
}

/// The startup sequencer. Consumed by [`Bootstrap::run`].
#[derive(Debug)]
pub struct Bootstrap {
    collaborators: Collaborators,
}

impl Bootstrap {
    /// Prepare a bootstrap over the given collaborators.
    pub const fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Run the startup sequence on the dispatcher and block until it has
    /// either reached `READY` or failed.
    ///
    /// Starts the dispatcher and scheduler threads. On failure both are
    /// joined again and the lifecycle ends in `STOPPED`.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`BootstrapError`].
    pub fn run(self, ctx: &AppContext) -> Result<BootReport, BootstrapError> {
        ctx.lifecycle.transition(ProcessState::Bootstrapping)?;

        let (tx, rx) = oneshot::channel();
        let scheduler = Arc::clone(&ctx.scheduler);
        let lifecycle = Arc::clone(&ctx.lifecycle);
        let collaborators = self.collaborators;

        let task = Task::new(BOOTSTRAP_TASK, move || {
            let outcome = run_steps(collaborators, &scheduler, &lifecycle);
            if let Err(e) = &outcome {
                error!(error = %e, "bootstrap failed");
            }
            if tx.send(outcome).is_err() {
                warn!("bootstrap outcome dropped, launcher is gone");
            }
            Ok(())
        });

        let outcome = ctx
            .dispatcher
            .submit(task)
            .map_err(BootstrapError::from)
            .and_then(|()| ctx.start())
            .and_then(|()| rx.blocking_recv().unwrap_or(Err(BootstrapError::Aborted)));

        if outcome.is_err() {
            ctx.abort();
        }
        outcome
    }
}

/// Steps 1-12. Runs on the dispatcher thread.
#[allow(clippy::too_many_lines)]
fn run_steps(
    collaborators: Collaborators,
    scheduler: &Scheduler,
    lifecycle: &Lifecycle,
) -> Result<BootReport, BootstrapError> {
    let Collaborators {
        config: config_source,
        mut keys,
        mut persistence,
        mut loaders,
        mut scripts,
        world,
        services,
        mut housekeeping,
        network,
    } = collaborators;

    world.lock().set_game_state(GameState::Startup);

    // 1. Configuration
    info!(source = %config_source.describe(), "loading configuration");
    let config = config_source.load()?;
    info!(
        server = %config.server.name,
        version = env!("CARGO_PKG_VERSION"),
        arch = std::env::consts::ARCH,
        "starting server"
    );
    let (password_type, unrecognised) = PasswordType::resolve(&config.server.password_type);
    if unrecognised {
        warn!(
            value = %config.server.password_type,
            "unknown password type, using plain"
        );
    }

    // 2. Keys
    keys.install(&config)
        .map_err(|e| BootstrapError::resource("key installation", e))?;
    info!("keys installed");

    // 3. Database
    prepare_database(persistence.as_mut(), &config, password_type)?;

    // 4. Static data
    for loader in &mut loaders {
        let name = loader.name().to_owned();
        info!(loader = %name, "loading");
        loader
            .load(&config)
            .map_err(|e| BootstrapError::resource(format!("loading {name}"), e))?;
    }

    // 5. Scripting
    info!("loading script systems");
    scripts
        .load_script_systems(&config)
        .map_err(|e| BootstrapError::resource("loading script systems", e))?;

    // 6. World type
    let world_type = config
        .server
        .world_type
        .parse::<WorldType>()
        .map_err(|e| BootstrapError::Configuration {
            reason: e.to_string(),
        })?;
    world.lock().set_world_type(world_type);
    info!(world_type = %world_type, "world type set");

    // 7. Map
    let map_path = config
        .server
        .data_dir
        .join("world")
        .join(format!("{}.otbm", config.server.map_name));
    info!(map = %map_path.display(), "loading map");
    {
        let mut world = world.lock();
        world
            .load_map(&map_path)
            .map_err(|e| BootstrapError::resource("loading map", e))?;
        world.set_game_state(GameState::Init);
    }

    // 8. Services
    let bindings = {
        let mut registry = services.lock();
        for (protocol, port) in protocol_ports(&config) {
            registry
                .register(protocol, port)
                .map_err(|e| BootstrapError::resource(format!("binding {protocol} on {port}"), e))?;
        }
        registry.bindings()
    };
    info!(count = bindings.len(), "protocol services registered");

    // 9. Maintenance events
    let autosave = schedule_autosave(scheduler, &world, &config)?;
    let server_save = schedule_server_save(scheduler, &world, &config)?;

    // 10. Housekeeping
    run_housekeeping(housekeeping.as_mut(), config.features.market_enabled);
    info!("loaded all modules, server starting up");

    // 11. Addresses
    let public = network
        .resolve(&config.server.ip)
        .ok_or_else(|| BootstrapError::Configuration {
            reason: format!("cannot resolve server ip {:?}", config.server.ip),
        })?;
    let addresses = ServerAddresses::new(network.local_host_addresses(), public);
    info!(public = %public, entries = addresses.entries().len(), "server addresses resolved");

    // 12. Ready
    if running_as_root() {
        warn!("running as root, this is not recommended");
    }
    {
        let mut world = world.lock();
        world.start(&bindings);
        world.set_game_state(GameState::Normal);
    }
    lifecycle.transition(ProcessState::Ready)?;

    Ok(BootReport {
        config,
        world_type,
        password_type,
        services: bindings,
        addresses,
        autosave,
        server_save,
    })
}

fn prepare_database(
    persistence: &mut dyn Persistence,
    config: &ServerConfig,
    password_type: PasswordType,
) -> Result<(), BootstrapError> {
    let backend = persistence
        .connect(&config.database.url)
        .map_err(|e| BootstrapError::resource("database connection", e))?;
    info!(backend = %backend, "database connected");

    let is_setup = persistence
        .is_database_setup()
        .map_err(|e| BootstrapError::resource("database check", e))?;
    if !is_setup {
        return Err(BootstrapError::resource(
            "database check",
            CollaboratorError::new("the database is empty, import the schema first"),
        ));
    }

    loop {
        let version = persistence
            .update_database()
            .map_err(|e| BootstrapError::resource("database update", e))?;
        if version == 0 {
            break;
        }
        info!(version, "database updated");
    }

    persistence
        .check_triggers()
        .map_err(|e| BootstrapError::resource("database trigger check", e))?;
    persistence
        .check_encryption(password_type)
        .map_err(|e| BootstrapError::resource("password encryption check", e))?;

    if config.database.optimize_tables {
        let optimized = persistence
            .optimize_tables()
            .map_err(|e| BootstrapError::resource("table optimization", e))?;
        if !optimized {
            info!("no tables were optimized");
        }
    }
    Ok(())
}

/// Protocols in registration order, with the port each listens on.
fn protocol_ports(config: &ServerConfig) -> [(Protocol, u16); 6] {
    let ports = &config.ports;
    [
        (Protocol::Game, ports.game),
        (Protocol::Login, ports.login),
        (Protocol::Admin, ports.admin),
        (Protocol::Status, ports.status),
        (Protocol::OldLogin, ports.login),
        (Protocol::OldGame, ports.login),
    ]
}

fn schedule_autosave(
    scheduler: &Scheduler,
    world: &SharedWorld,
    config: &ServerConfig,
) -> Result<Option<EventId>, BootstrapError> {
    let minutes = config.maintenance.auto_save_each_minutes;
    if minutes == 0 {
        return Ok(None);
    }
    let interval = Duration::from_secs(60)
        .checked_mul(minutes)
        .ok_or_else(|| BootstrapError::Configuration {
            reason: format!("autosave interval of {minutes} minutes is too large"),
        })?;

    let world = Arc::clone(world);
    let job = RepeatingJob::new("autosave", move || Ok(world.lock().auto_save()?));
    let id = scheduler.add_periodic(interval, interval, job)?;
    info!(event = %id, minutes, "autosave scheduled");
    Ok(Some(id))
}

fn schedule_server_save(
    scheduler: &Scheduler,
    world: &SharedWorld,
    config: &ServerConfig,
) -> Result<Option<EventId>, BootstrapError> {
    if !config.maintenance.server_save_enabled {
        return Ok(None);
    }
    let hour = config.maintenance.server_save_hour;
    let Some(delay) = server_save::next_server_save_delay(hour) else {
        warn!(hour, "server save hour out of range, daily save not scheduled");
        return Ok(None);
    };

    let world = Arc::clone(world);
    let job = RepeatingJob::new("prepare server save", move || {
        Ok(world.lock().prepare_server_save()?)
    });
    let id = scheduler.add_periodic(delay, ONE_DAY, job)?;
    info!(event = %id, hour, in_secs = delay.as_secs(), "server save scheduled");
    Ok(Some(id))
}

/// Whether the process runs with an effective uid of 0.
#[cfg(target_os = "linux")]
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;

    // /proc/self is owned by the effective uid.
    std::fs::metadata("/proc/self").is_ok_and(|meta| meta.uid() == 0)
}

#[cfg(not(target_os = "linux"))]
const fn running_as_root() -> bool {
    false
}

/// Post-load maintenance. Failures are logged and skipped.
fn run_housekeeping(housekeeping: &mut dyn Housekeeping, market_enabled: bool) {
    let log_failure = |what: &str, result: Result<(), CollaboratorError>| {
        if let Err(e) = result {
            warn!(step = what, error = %e, "housekeeping step failed");
        }
    };

    log_failure("pay houses", housekeeping.pay_houses());
    log_failure("update house owners", housekeeping.update_house_owners());
    log_failure("reload npcs", housekeeping.reload_npcs());
    if market_enabled {
        log_failure(
            "expire market offers",
            housekeeping.check_expired_market_offers(),
        );
        log_failure(
            "update market statistics",
            housekeeping.update_market_statistics(),
        );
    }
}
