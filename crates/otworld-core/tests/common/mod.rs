//! Recording collaborators shared by the integration tests.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use otworld_core::collaborators::{
    CollaboratorError, CollaboratorResult, Collaborators, DataLoader, Housekeeping, KeyInstaller,
    Persistence, ScriptEngine, ServiceRegistry, SharedServices, SharedWorld,
    StaticNetworkIdentity, World,
};
use otworld_core::config::{ServerConfig, StaticConfigSource};
use otworld_core::network::ServerAddresses;
use otworld_core::rules::{GameState, PasswordType, Protocol, ServiceBinding, WorldType};
use parking_lot::Mutex;

/// Ordered record of every collaborator call.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }
}

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

pub struct FakeKeys(pub Journal);

impl KeyInstaller for FakeKeys {
    fn install(&mut self, _config: &ServerConfig) -> CollaboratorResult<()> {
        self.0.record("keys");
        Ok(())
    }
}

pub struct FakePersistence {
    pub journal: Journal,
    pub connect_error: Option<String>,
    pub setup: bool,
    /// Versions returned by successive `update_database` calls before 0.
    pub migrations: Vec<u32>,
    pub optimized: bool,
}

impl Persistence for FakePersistence {
    fn connect(&mut self, _url: &str) -> CollaboratorResult<String> {
        self.journal.record("db connect");
        match &self.connect_error {
            Some(message) => Err(CollaboratorError::new(message.clone())),
            None => Ok("fake".to_owned()),
        }
    }

    fn is_database_setup(&mut self) -> CollaboratorResult<bool> {
        self.journal.record("db setup check");
        Ok(self.setup)
    }

    fn update_database(&mut self) -> CollaboratorResult<u32> {
        let version = if self.migrations.is_empty() {
            0
        } else {
            self.migrations.remove(0)
        };
        self.journal.record(format!("db update {version}"));
        Ok(version)
    }

    fn check_triggers(&mut self) -> CollaboratorResult<()> {
        self.journal.record("db triggers");
        Ok(())
    }

    fn check_encryption(&mut self, password_type: PasswordType) -> CollaboratorResult<()> {
        self.journal.record(format!("db encryption {password_type}"));
        Ok(())
    }

    fn optimize_tables(&mut self) -> CollaboratorResult<bool> {
        self.journal.record("db optimize");
        Ok(self.optimized)
    }
}

pub struct FakeLoader {
    pub name: String,
    pub journal: Journal,
    pub fail: bool,
}

impl DataLoader for FakeLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self, _config: &ServerConfig) -> CollaboratorResult<()> {
        self.journal.record(format!("load {}", self.name));
        if self.fail {
            Err(CollaboratorError::new(format!("{} is corrupt", self.name)))
        } else {
            Ok(())
        }
    }
}

pub struct FakeScripts(pub Journal);

impl ScriptEngine for FakeScripts {
    fn load_script_systems(&mut self, _config: &ServerConfig) -> CollaboratorResult<()> {
        self.0.record("scripts");
        Ok(())
    }
}

pub struct FakeWorld {
    pub journal: Journal,
    pub states: Vec<GameState>,
    pub world_type: Option<WorldType>,
    pub saves: u32,
    /// Set without synchronization of its own when the world starts.
    pub started: Arc<AtomicBool>,
    pub panic_on_map: bool,
}

impl World for FakeWorld {
    fn set_game_state(&mut self, state: GameState) {
        self.journal.record(format!("state {state}"));
        self.states.push(state);
    }

    fn set_world_type(&mut self, world_type: WorldType) {
        self.journal.record(format!("world type {world_type}"));
        self.world_type = Some(world_type);
    }

    fn load_map(&mut self, path: &Path) -> CollaboratorResult<()> {
        assert!(!self.panic_on_map, "map loader exploded");
        self.journal.record(format!(
            "map {}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        ));
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
        self.journal.record(format!("world start {}", services.len()));
        self.started.store(true, Ordering::Relaxed);
    }
}

pub struct FakeHousekeeping {
    pub journal: Journal,
    pub fail_pay_houses: bool,
}

impl Housekeeping for FakeHousekeeping {
    fn pay_houses(&mut self) -> CollaboratorResult<()> {
        self.journal.record("pay houses");
        if self.fail_pay_houses {
            Err(CollaboratorError::new("house ledger locked"))
        } else {
            Ok(())
        }
    }

    fn update_house_owners(&mut self) -> CollaboratorResult<()> {
        self.journal.record("house owners");
        Ok(())
    }

    fn reload_npcs(&mut self) -> CollaboratorResult<()> {
        self.journal.record("npcs");
        Ok(())
    }

    fn check_expired_market_offers(&mut self) -> CollaboratorResult<()> {
        self.journal.record("market offers");
        Ok(())
    }

    fn update_market_statistics(&mut self) -> CollaboratorResult<()> {
        self.journal.record("market statistics");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeServices {
    pub bindings: Vec<ServiceBinding>,
}

impl ServiceRegistry for FakeServices {
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
        Ok(())
    }

    fn stop(&mut self) {}
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub const LOADERS: [&str; 8] = [
    "vocations",
    "commands",
    "items (OTB)",
    "items (XML)",
    "monsters",
    "outfits",
    "admin protocol config",
    "experience stages",
];

/// Everything a bootstrap test needs to build and then inspect.
pub struct Harness {
    pub config: ServerConfig,
    pub journal: Journal,
    pub persistence: FakePersistence,
    pub failing_loader: Option<&'static str>,
    pub fail_pay_houses: bool,
    pub panic_on_map: bool,
    pub world: Arc<Mutex<FakeWorld>>,
    pub services: Arc<Mutex<FakeServices>>,
    pub started: Arc<AtomicBool>,
}

impl Harness {
    pub fn new() -> Self {
        let journal = Journal::default();
        let started = Arc::new(AtomicBool::new(false));
        Self {
            config: ServerConfig::default(),
            persistence: FakePersistence {
                journal: journal.clone(),
                connect_error: None,
                setup: true,
                migrations: Vec::new(),
                optimized: true,
            },
            failing_loader: None,
            fail_pay_houses: false,
            panic_on_map: false,
            world: Arc::new(Mutex::new(FakeWorld {
                journal: journal.clone(),
                states: Vec::new(),
                world_type: None,
                saves: 0,
                started: Arc::clone(&started),
                panic_on_map: false,
            })),
            services: Arc::new(Mutex::new(FakeServices::default())),
            started,
            journal,
        }
    }

    /// Build the collaborator set. The harness keeps handles to the world
    /// and services for inspection.
    pub fn collaborators(&mut self) -> Collaborators {
        self.world.lock().panic_on_map = self.panic_on_map;
        let persistence = FakePersistence {
            journal: self.journal.clone(),
            connect_error: self.persistence.connect_error.take(),
            setup: self.persistence.setup,
            migrations: std::mem::take(&mut self.persistence.migrations),
            optimized: self.persistence.optimized,
        };
        let loaders = LOADERS
            .iter()
            .map(|name| {
                Box::new(FakeLoader {
                    name: (*name).to_owned(),
                    journal: self.journal.clone(),
                    fail: self.failing_loader == Some(*name),
                }) as Box<dyn DataLoader>
            })
            .collect();

        Collaborators {
            config: Box::new(StaticConfigSource(self.config.clone())),
            keys: Box::new(FakeKeys(self.journal.clone())),
            persistence: Box::new(persistence),
            loaders,
            scripts: Box::new(FakeScripts(self.journal.clone())),
            world: Arc::clone(&self.world) as SharedWorld,
            services: Arc::clone(&self.services) as SharedServices,
            housekeeping: Box::new(FakeHousekeeping {
                journal: self.journal.clone(),
                fail_pay_houses: self.fail_pay_houses,
            }),
            network: Box::new(StaticNetworkIdentity {
                local: vec![Ipv4Addr::new(192, 168, 0, 2)],
            }),
        }
    }
}
