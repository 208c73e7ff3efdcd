//! Interfaces to everything bootstrap drives but does not own.
//!
//! Persistence, static data, scripting, the world model, housekeeping,
//! network listeners and address resolution are all collaborators. Each
//! is a trait so the binary can wire real implementations and tests can
//! wire recording fakes. The `Stub*` types here do nothing and always
//! succeed; they exist for wiring that has no real backend yet.
//!
//! Every method is called from the dispatcher thread, either from the
//! bootstrap task or from a scheduled event. Implementations therefore
//! need `Send` but no internal locking of their own.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ConfigSource, ServerConfig};
use crate::network::ServerAddresses;
use crate::rules::{GameState, PasswordType, Protocol, ServiceBinding, WorldType};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CollaboratorError {
    message: String,
}

impl CollaboratorError {
    /// Create an error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error description.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Shorthand for collaborator results.
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Installs the server's private key for the login handshake.
pub trait KeyInstaller: Send {
    /// Install the key.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if no usable key is available.
    fn install(&mut self, config: &ServerConfig) -> CollaboratorResult<()>;
}

/// Database connection, schema management and integrity checks.
pub trait Persistence: Send {
    /// Open the connection. Returns a short description of the backend.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the database is unreachable.
    fn connect(&mut self, url: &str) -> CollaboratorResult<String>;

    /// Whether the schema has been imported.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the check cannot be performed.
    fn is_database_setup(&mut self) -> CollaboratorResult<bool>;

    /// Apply the next pending migration. Returns the version reached, or
    /// `0` when the schema is already current.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if a migration fails.
    fn update_database(&mut self) -> CollaboratorResult<u32>;

    /// Verify database triggers.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if a trigger is missing or broken.
    fn check_triggers(&mut self) -> CollaboratorResult<()>;

    /// Verify that stored passwords use `password_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on a mismatch.
    fn check_encryption(&mut self, password_type: PasswordType) -> CollaboratorResult<()>;

    /// Optimize tables. Returns whether anything was optimized.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if optimization fails outright.
    fn optimize_tables(&mut self) -> CollaboratorResult<bool>;
}

/// Loads one kind of static game data (items, monsters, ...).
pub trait DataLoader: Send {
    /// What this loader loads, for logs and diagnostics.
    fn name(&self) -> &str;

    /// Load the data.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the data is missing or malformed.
    fn load(&mut self, config: &ServerConfig) -> CollaboratorResult<()>;
}

/// The scripting subsystem (actions, movements, spells, ...).
pub trait ScriptEngine: Send {
    /// Load every script system.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if a script system fails to load.
    fn load_script_systems(&mut self, config: &ServerConfig) -> CollaboratorResult<()>;
}

/// The game world. Only ever touched from the dispatcher thread.
pub trait World: Send {
    /// Record the coarse game state.
    fn set_game_state(&mut self, state: GameState);

    /// Apply the PvP ruleset.
    fn set_world_type(&mut self, world_type: WorldType);

    /// Load the map from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the map cannot be loaded.
    fn load_map(&mut self, path: &Path) -> CollaboratorResult<()>;

    /// Persist players and houses. Runs on the autosave schedule.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if saving fails.
    fn auto_save(&mut self) -> CollaboratorResult<()>;

    /// Warn players and start the daily server save.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the save cannot be started.
    fn prepare_server_save(&mut self) -> CollaboratorResult<()>;

    /// Begin world simulation with the given services open.
    fn start(&mut self, services: &[ServiceBinding]);
}

/// One-time maintenance run after everything is loaded.
pub trait Housekeeping: Send {
    /// Charge rent for houses.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on failure.
    fn pay_houses(&mut self) -> CollaboratorResult<()>;

    /// Refresh house ownership from the database.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on failure.
    fn update_house_owners(&mut self) -> CollaboratorResult<()>;

    /// Reload NPC definitions.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on failure.
    fn reload_npcs(&mut self) -> CollaboratorResult<()>;

    /// Return expired market offers to their owners.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on failure.
    fn check_expired_market_offers(&mut self) -> CollaboratorResult<()>;

    /// Recompute market statistics.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] on failure.
    fn update_market_statistics(&mut self) -> CollaboratorResult<()>;
}

/// Network listeners. Bootstrap registers protocols; the launcher runs
/// and stops them.
pub trait ServiceRegistry: Send {
    /// Bind `protocol` to `port`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if the port cannot be used.
    fn register(&mut self, protocol: Protocol, port: u16) -> CollaboratorResult<()>;

    /// Everything registered so far, in registration order.
    fn bindings(&self) -> Vec<ServiceBinding>;

    /// Whether there is at least one listener to run.
    fn is_running(&self) -> bool;

    /// Start accepting connections. Must not block.
    ///
    /// `addresses` decides which server address each client is told to use.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError`] if listeners cannot be started.
    fn run(&mut self, addresses: &ServerAddresses) -> CollaboratorResult<()>;

    /// Stop accepting connections.
    fn stop(&mut self);
}

/// Resolves the host's own addresses and the configured public address.
pub trait NetworkIdentity: Send {
    /// Every IPv4 address the local host name resolves to.
    fn local_host_addresses(&self) -> Vec<Ipv4Addr>;

    /// Resolve an IPv4 literal or host name.
    fn resolve(&self, host: &str) -> Option<Ipv4Addr>;
}

/// World handle shared between bootstrap and scheduled events.
pub type SharedWorld = Arc<Mutex<dyn World>>;

/// Service registry handle shared between bootstrap and the launcher.
pub type SharedServices = Arc<Mutex<dyn ServiceRegistry>>;

/// Everything bootstrap needs, moved onto the dispatcher thread with the
/// bootstrap task.
pub struct Collaborators {
    /// Step 1.
    pub config: Box<dyn ConfigSource>,
    /// Step 2.
    pub keys: Box<dyn KeyInstaller>,
    /// Step 3.
    pub persistence: Box<dyn Persistence>,
    /// Step 4, run in order.
    pub loaders: Vec<Box<dyn DataLoader>>,
    /// Step 5.
    pub scripts: Box<dyn ScriptEngine>,
    /// Steps 6, 7, 9 and world start.
    pub world: SharedWorld,
    /// Step 8; kept by the launcher afterwards.
    pub services: SharedServices,
    /// Step 10.
    pub housekeeping: Box<dyn Housekeeping>,
    /// Step 11.
    pub network: Box<dyn NetworkIdentity>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let loaders: Vec<&str> = self.loaders.iter().map(|l| l.name()).collect();
        f.debug_struct("Collaborators")
            .field("config", &self.config.describe())
            .field("loaders", &loaders)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

/// Key installer that accepts whatever is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubKeyInstaller;

impl KeyInstaller for StubKeyInstaller {
    fn install(&mut self, _config: &ServerConfig) -> CollaboratorResult<()> {
        debug!("stub key installer: nothing to install");
        Ok(())
    }
}

/// Persistence with an already-current schema and nothing to optimize.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubPersistence;

impl Persistence for StubPersistence {
    fn connect(&mut self, _url: &str) -> CollaboratorResult<String> {
        Ok("stub".to_owned())
    }

    fn is_database_setup(&mut self) -> CollaboratorResult<bool> {
        Ok(true)
    }

    fn update_database(&mut self) -> CollaboratorResult<u32> {
        Ok(0)
    }

    fn check_triggers(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn check_encryption(&mut self, _password_type: PasswordType) -> CollaboratorResult<()> {
        Ok(())
    }

    fn optimize_tables(&mut self) -> CollaboratorResult<bool> {
        Ok(false)
    }
}

/// Script engine with no script systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubScriptEngine;

impl ScriptEngine for StubScriptEngine {
    fn load_script_systems(&mut self, _config: &ServerConfig) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// World that only remembers what it was told.
#[derive(Debug, Clone, Default)]
pub struct StubWorld {
    /// Last game state set.
    pub state: Option<GameState>,
    /// Ruleset applied.
    pub world_type: Option<WorldType>,
    /// Number of autosaves performed.
    pub saves: u32,
    /// Services the world was started with, once started.
    pub started_with: Option<Vec<ServiceBinding>>,
}

impl World for StubWorld {
    fn set_game_state(&mut self, state: GameState) {
        self.state = Some(state);
    }

    fn set_world_type(&mut self, world_type: WorldType) {
        self.world_type = Some(world_type);
    }

    fn load_map(&mut self, _path: &Path) -> CollaboratorResult<()> {
        Ok(())
    }

    fn auto_save(&mut self) -> CollaboratorResult<()> {
        self.saves = self.saves.saturating_add(1);
        Ok(())
    }

    fn prepare_server_save(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn start(&mut self, services: &[ServiceBinding]) {
        self.started_with = Some(services.to_vec());
    }
}

/// Housekeeping with nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubHousekeeping;

impl Housekeeping for StubHousekeeping {
    fn pay_houses(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn update_house_owners(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn reload_npcs(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn check_expired_market_offers(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }

    fn update_market_statistics(&mut self) -> CollaboratorResult<()> {
        Ok(())
    }
}

/// Registry that records bindings without opening sockets.
#[derive(Debug, Clone, Default)]
pub struct StubServiceRegistry {
    bindings: Vec<ServiceBinding>,
    running: bool,
}

impl StubServiceRegistry {
    /// Whether `run` has been called without a later `stop`.
    pub const fn is_listening(&self) -> bool {
        self.running
    }
}

impl ServiceRegistry for StubServiceRegistry {
    fn register(&mut self, protocol: Protocol, port: u16) -> CollaboratorResult<()> {
        self.bindings.push(ServiceBinding { protocol, port });
        Ok(())
    }

    fn bindings(&self) -> Vec<ServiceBinding> {
        self.bindings.clone()
    }

    fn is_running(&self) -> bool {
        !self.bindings.is_empty()
    }

    fn run(&mut self, _addresses: &ServerAddresses) -> CollaboratorResult<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Network identity with fixed answers.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkIdentity {
    /// Returned by [`NetworkIdentity::local_host_addresses`].
    pub local: Vec<Ipv4Addr>,
}

impl NetworkIdentity for StaticNetworkIdentity {
    fn local_host_addresses(&self) -> Vec<Ipv4Addr> {
        self.local.clone()
    }

    fn resolve(&self, host: &str) -> Option<Ipv4Addr> {
        host.trim().parse().ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn stub_registry_runs_only_with_bindings() {
        let mut registry = StubServiceRegistry::default();
        assert!(!registry.is_running());
        registry.register(Protocol::Status, 7171).unwrap();
        assert!(registry.is_running());
        assert_eq!(
            registry.bindings(),
            vec![ServiceBinding {
                protocol: Protocol::Status,
                port: 7171
            }]
        );

        let addresses = ServerAddresses::new(Vec::new(), Ipv4Addr::new(10, 0, 0, 1));
        registry.run(&addresses).unwrap();
        assert!(registry.is_listening());
        registry.stop();
        assert!(!registry.is_listening());
    }

    #[test]
    fn static_identity_only_resolves_literals() {
        let identity = StaticNetworkIdentity::default();
        assert_eq!(identity.resolve("10.0.0.1"), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(identity.resolve("example.org"), None);
    }

    #[test]
    fn shared_world_coerces_from_stub() {
        let world: SharedWorld = Arc::new(Mutex::new(StubWorld::default()));
        world.lock().set_game_state(GameState::Init);
        world.lock().auto_save().unwrap();
    }

    #[test]
    fn collaborator_error_displays_message() {
        let err = CollaboratorError::new("connection refused");
        assert_eq!(err.to_string(), "connection refused");
        assert_eq!(err.message(), "connection refused");
    }
}
