//! File-backed collaborators for running a single server from a data
//! directory.
//!
//! ```text
//!   <data_dir>/
//!     XML/vocations.xml  XML/commands.xml  XML/outfits.xml
//!     XML/admin.xml      XML/stages.xml
//!     items/items.otb    items/items.xml
//!     monster/monsters.xml
//!     actions/ movements/ talkactions/ spells/ creaturescripts/ globalevents/
//!     world/<map_name>.otbm
//! ```
//!
//! Static data and scripts are checked for presence only; parsing them is
//! the job of the game-rule crates. The database is a directory holding a
//! `schema_version` file and a `password_type` marker.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use otworld_core::collaborators::{
    CollaboratorError, CollaboratorResult, Collaborators, DataLoader, Housekeeping, Persistence,
    ScriptEngine, ServiceRegistry, SharedServices, SharedWorld, StubKeyInstaller, World,
};
use otworld_core::config::{ConfigSource, ServerConfig};
use otworld_core::network::{ServerAddresses, SystemNetworkIdentity};
use otworld_core::rules::{GameState, PasswordType, Protocol, ServiceBinding, WorldType};
use tracing::{debug, info, warn};

/// Schema version the local database is migrated up to.
pub const SCHEMA_VERSION: u32 = 3;

const SCHEMA_FILE: &str = "schema_version";
const PASSWORD_FILE: &str = "password_type";
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Wire the file-backed collaborators around a config source and the
/// shared world and service handles.
pub fn collaborators(
    config: Box<dyn ConfigSource>,
    world: SharedWorld,
    services: SharedServices,
) -> Collaborators {
    Collaborators {
        config,
        keys: Box::new(StubKeyInstaller),
        persistence: Box::new(DirectoryDatabase::default()),
        loaders: static_data_loaders(),
        scripts: Box::new(ScriptDirectories),
        world,
        services,
        housekeeping: Box::new(LoggingHousekeeping),
        network: Box::new(SystemNetworkIdentity),
    }
}

// ---------------------------------------------------------------------------
// Static data
// ---------------------------------------------------------------------------

/// A loader that requires one file under the data directory.
#[derive(Debug, Clone)]
pub struct RequiredFile {
    name: &'static str,
    relative: &'static str,
}

impl RequiredFile {
    /// Require `relative` (under `server.data_dir`) for the data called `name`.
    pub const fn new(name: &'static str, relative: &'static str) -> Self {
        Self { name, relative }
    }
}

impl DataLoader for RequiredFile {
    fn name(&self) -> &str {
        self.name
    }

    fn load(&mut self, config: &ServerConfig) -> CollaboratorResult<()> {
        let path = config.server.data_dir.join(self.relative);
        require_file(&path)
    }
}

/// Loaders in startup order.
pub fn static_data_loaders() -> Vec<Box<dyn DataLoader>> {
    [
        RequiredFile::new("vocations", "XML/vocations.xml"),
        RequiredFile::new("commands", "XML/commands.xml"),
        RequiredFile::new("items (OTB)", "items/items.otb"),
        RequiredFile::new("items (XML)", "items/items.xml"),
        RequiredFile::new("monsters", "monster/monsters.xml"),
        RequiredFile::new("outfits", "XML/outfits.xml"),
        RequiredFile::new("admin protocol config", "XML/admin.xml"),
        RequiredFile::new("experience stages", "XML/stages.xml"),
    ]
    .into_iter()
    .map(|loader| Box::new(loader) as Box<dyn DataLoader>)
    .collect()
}

fn require_file(path: &Path) -> CollaboratorResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CollaboratorError::new(format!(
            "missing data file {}",
            path.display()
        )))
    }
}

/// Script systems, each a directory under the data directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptDirectories;

impl ScriptDirectories {
    /// Directory names, in load order.
    pub const SYSTEMS: [&'static str; 6] = [
        "actions",
        "movements",
        "talkactions",
        "spells",
        "creaturescripts",
        "globalevents",
    ];
}

impl ScriptEngine for ScriptDirectories {
    fn load_script_systems(&mut self, config: &ServerConfig) -> CollaboratorResult<()> {
        for system in Self::SYSTEMS {
            let dir = config.server.data_dir.join(system);
            if !dir.is_dir() {
                return Err(CollaboratorError::new(format!(
                    "missing script system directory {}",
                    dir.display()
                )));
            }
            debug!(system, "script system found");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Database kept as marker files in a directory (`database.url`).
#[derive(Debug, Default)]
pub struct DirectoryDatabase {
    root: Option<PathBuf>,
}

impl DirectoryDatabase {
    fn root(&self) -> CollaboratorResult<&Path> {
        self.root
            .as_deref()
            .ok_or_else(|| CollaboratorError::new("database is not connected"))
    }

    fn read_version(&self) -> CollaboratorResult<Option<u32>> {
        let path = self.root()?.join(SCHEMA_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse().map(Some).map_err(|e| {
                CollaboratorError::new(format!("corrupt {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

fn io_error(path: &Path, e: &io::Error) -> CollaboratorError {
    CollaboratorError::new(format!("{}: {e}", path.display()))
}

impl Persistence for DirectoryDatabase {
    fn connect(&mut self, url: &str) -> CollaboratorResult<String> {
        let root = PathBuf::from(url);
        if !root.is_dir() {
            return Err(CollaboratorError::new(format!(
                "cannot open database directory {}",
                root.display()
            )));
        }
        let description = format!("directory {}", root.display());
        self.root = Some(root);
        Ok(description)
    }

    fn is_database_setup(&mut self) -> CollaboratorResult<bool> {
        Ok(self.read_version()?.is_some())
    }

    fn update_database(&mut self) -> CollaboratorResult<u32> {
        let current = self.read_version()?.unwrap_or(0);
        if current >= SCHEMA_VERSION {
            return Ok(0);
        }
        let next = current.saturating_add(1);
        let path = self.root()?.join(SCHEMA_FILE);
        fs::write(&path, next.to_string()).map_err(|e| io_error(&path, &e))?;
        Ok(next)
    }

    fn check_triggers(&mut self) -> CollaboratorResult<()> {
        self.root().map(|_| ())
    }

    fn check_encryption(&mut self, password_type: PasswordType) -> CollaboratorResult<()> {
        let path = self.root()?.join(PASSWORD_FILE);
        match fs::read_to_string(&path) {
            Ok(stored) if stored.trim() == password_type.to_string() => Ok(()),
            Ok(stored) => Err(CollaboratorError::new(format!(
                "passwords are stored as {}, configuration says {password_type}",
                stored.trim()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(password_type = %password_type, "recording password type");
                fs::write(&path, password_type.to_string()).map_err(|e| io_error(&path, &e))
            }
            Err(e) => Err(io_error(&path, &e)),
        }
    }

    fn optimize_tables(&mut self) -> CollaboratorResult<bool> {
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// World and housekeeping
// ---------------------------------------------------------------------------

/// Minimal world: checks the map file and records state.
#[derive(Debug, Default)]
pub struct LocalWorld {
    state: Option<GameState>,
    world_type: Option<WorldType>,
    map: Option<PathBuf>,
    saves: u64,
}

impl World for LocalWorld {
    fn set_game_state(&mut self, state: GameState) {
        debug!(state = %state, "game state");
        self.state = Some(state);
    }

    fn set_world_type(&mut self, world_type: WorldType) {
        self.world_type = Some(world_type);
    }

    fn load_map(&mut self, path: &Path) -> CollaboratorResult<()> {
        require_file(path)?;
        self.map = Some(path.to_path_buf());
        Ok(())
    }

    fn auto_save(&mut self) -> CollaboratorResult<()> {
        self.saves = self.saves.saturating_add(1);
        info!(saves = self.saves, "autosave");
        Ok(())
    }

    fn prepare_server_save(&mut self) -> CollaboratorResult<()> {
        info!("server save in 5 minutes");
        Ok(())
    }

    fn start(&mut self, services: &[ServiceBinding]) {
        info!(
            services = services.len(),
            state = ?self.state,
            world_type = ?self.world_type,
            map = ?self.map,
            "world started"
        );
    }
}

/// Housekeeping with nothing persistent behind it; logs each step.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHousekeeping;

impl Housekeeping for LoggingHousekeeping {
    fn pay_houses(&mut self) -> CollaboratorResult<()> {
        debug!("paying houses");
        Ok(())
    }

    fn update_house_owners(&mut self) -> CollaboratorResult<()> {
        debug!("updating house owners");
        Ok(())
    }

    fn reload_npcs(&mut self) -> CollaboratorResult<()> {
        debug!("reloading npcs");
        Ok(())
    }

    fn check_expired_market_offers(&mut self) -> CollaboratorResult<()> {
        debug!("expiring market offers");
        Ok(())
    }

    fn update_market_statistics(&mut self) -> CollaboratorResult<()> {
        debug!("updating market statistics");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Opens one TCP listener per distinct port.
///
/// Connections are accepted, told which server address applies to them,
/// and closed; protocol handlers attach here.
#[derive(Debug, Default)]
pub struct TcpServiceRegistry {
    bindings: Vec<ServiceBinding>,
    stop: Arc<AtomicBool>,
    listeners: Vec<JoinHandle<()>>,
}

impl TcpServiceRegistry {
    /// Create a registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.bindings.iter().map(|b| b.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    fn protocols_on(&self, port: u16) -> Vec<Protocol> {
        self.bindings
            .iter()
            .filter(|b| b.port == port)
            .map(|b| b.protocol)
            .collect()
    }
}

impl ServiceRegistry for TcpServiceRegistry {
    fn register(&mut self, protocol: Protocol, port: u16) -> CollaboratorResult<()> {
        if port == 0 {
            return Err(CollaboratorError::new(format!("{protocol} has no port")));
        }
        self.bindings.push(ServiceBinding { protocol, port });
        Ok(())
    }

    fn bindings(&self) -> Vec<ServiceBinding> {
        self.bindings.clone()
    }

    fn is_running(&self) -> bool {
        !self.bindings.is_empty()
    }

    fn run(&mut self, addresses: &ServerAddresses) -> CollaboratorResult<()> {
        let addresses = Arc::new(addresses.clone());
        for port in self.ports() {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .and_then(|l| l.set_nonblocking(true).map(|()| l))
                .map_err(|e| CollaboratorError::new(format!("cannot listen on {port}: {e}")))?;
            let protocols = self.protocols_on(port);
            info!(port, protocols = ?protocols, "listening");

            let stop = Arc::clone(&self.stop);
            let addresses = Arc::clone(&addresses);
            let handle = thread::Builder::new()
                .name(format!("listener-{port}"))
                .spawn(move || accept_loop(&listener, &stop, &addresses, port))
                .map_err(|e| CollaboratorError::new(format!("cannot spawn listener: {e}")))?;
            self.listeners.push(handle);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.listeners.drain(..) {
            if handle.join().is_err() {
                warn!("listener thread terminated abnormally");
            }
        }
        info!("listeners closed");
    }
}

fn accept_loop(listener: &TcpListener, stop: &AtomicBool, addresses: &ServerAddresses, port: u16) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((_stream, peer)) => {
                let advertised = advertised_address(addresses, peer);
                debug!(port, peer = %peer, advertised = ?advertised, "connection accepted");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(port, error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// The server address a connecting peer should use. IPv6 peers get the
/// public address.
fn advertised_address(addresses: &ServerAddresses, peer: SocketAddr) -> Option<Ipv4Addr> {
    match peer.ip() {
        IpAddr::V4(ip) => addresses.advertised_for(ip),
        IpAddr::V6(_) => addresses.public(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config_for(dir: &Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn missing_data_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = RequiredFile::new("vocations", "XML/vocations.xml");
        let err = loader.load(&config_for(dir.path())).unwrap_err();
        assert!(err.message().contains("vocations.xml"));

        fs::create_dir_all(dir.path().join("XML")).unwrap();
        fs::write(dir.path().join("XML/vocations.xml"), "<vocations/>").unwrap();
        loader.load(&config_for(dir.path())).unwrap();
    }

    #[test]
    fn loaders_keep_startup_order() {
        let names: Vec<String> = static_data_loaders()
            .iter()
            .map(|l| l.name().to_owned())
            .collect();
        assert_eq!(names.first().map(String::as_str), Some("vocations"));
        assert_eq!(names.last().map(String::as_str), Some("experience stages"));
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn script_directories_are_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        assert!(ScriptDirectories.load_script_systems(&config).is_err());
        for system in ScriptDirectories::SYSTEMS {
            fs::create_dir_all(dir.path().join(system)).unwrap();
        }
        ScriptDirectories.load_script_systems(&config).unwrap();
    }

    #[test]
    fn database_migrates_to_current_version() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SCHEMA_FILE), "1").unwrap();

        let mut db = DirectoryDatabase::default();
        db.connect(dir.path().to_str().unwrap()).unwrap();
        assert!(db.is_database_setup().unwrap());

        let mut reached = Vec::new();
        loop {
            let version = db.update_database().unwrap();
            if version == 0 {
                break;
            }
            reached.push(version);
        }
        assert_eq!(reached, vec![2, 3]);
        assert_eq!(db.update_database().unwrap(), 0);
    }

    #[test]
    fn empty_database_is_not_set_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DirectoryDatabase::default();
        db.connect(dir.path().to_str().unwrap()).unwrap();
        assert!(!db.is_database_setup().unwrap());
    }

    #[test]
    fn missing_database_directory_fails_to_connect() {
        let mut db = DirectoryDatabase::default();
        assert!(db.connect("/nonexistent/otworld/db").is_err());
        assert!(db.is_database_setup().is_err());
    }

    #[test]
    fn password_type_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DirectoryDatabase::default();
        db.connect(dir.path().to_str().unwrap()).unwrap();

        db.check_encryption(PasswordType::Sha1).unwrap();
        db.check_encryption(PasswordType::Sha1).unwrap();
        let err = db.check_encryption(PasswordType::Md5).unwrap_err();
        assert!(err.message().contains("sha1"));
    }

    #[test]
    fn registry_groups_protocols_by_port() {
        let mut registry = TcpServiceRegistry::new();
        assert!(!registry.is_running());
        registry.register(Protocol::Game, 7172).unwrap();
        registry.register(Protocol::Login, 7171).unwrap();
        registry.register(Protocol::OldLogin, 7171).unwrap();
        assert!(registry.register(Protocol::Status, 0).is_err());

        assert!(registry.is_running());
        assert_eq!(registry.ports(), vec![7171, 7172]);
        assert_eq!(
            registry.protocols_on(7171),
            vec![Protocol::Login, Protocol::OldLogin]
        );
    }

    #[test]
    fn peers_are_told_the_matching_address() {
        let local = Ipv4Addr::new(192, 168, 1, 10);
        let public = Ipv4Addr::new(203, 0, 113, 5);
        let addresses = ServerAddresses::new([local], public);

        let loopback: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let lan: SocketAddr = "192.168.1.10:50000".parse().unwrap();
        let remote: SocketAddr = "198.51.100.7:50000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:50000".parse().unwrap();

        assert_eq!(
            advertised_address(&addresses, loopback),
            Some(Ipv4Addr::LOCALHOST)
        );
        assert_eq!(advertised_address(&addresses, lan), Some(local));
        assert_eq!(advertised_address(&addresses, remote), Some(public));
        assert_eq!(advertised_address(&addresses, v6), Some(public));
    }

    #[test]
    fn registry_listens_until_stopped() {
        let free = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let mut registry = TcpServiceRegistry::new();
        registry.register(Protocol::Status, port).unwrap();
        let addresses = ServerAddresses::new(Vec::new(), Ipv4Addr::LOCALHOST);
        registry.run(&addresses).unwrap();
        std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

        registry.stop();
        assert!(registry.listeners.is_empty());
    }

    #[test]
    fn local_world_requires_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("world.otbm");
        let mut world = LocalWorld::default();
        assert!(world.load_map(&map).is_err());
        fs::write(&map, b"OTBM").unwrap();
        world.load_map(&map).unwrap();
        world.set_game_state(GameState::Init);
        world.auto_save().unwrap();
        assert_eq!(world.state, Some(GameState::Init));
        assert_eq!(world.saves, 1);
    }
}
