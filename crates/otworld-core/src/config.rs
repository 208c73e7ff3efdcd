//! Configuration loading and typed config structures for the game server.
//!
//! The server reads `otworld-config.yaml` (or the path given with
//! `--config`). This module defines strongly-typed structs that mirror the
//! YAML structure and a [`ConfigSource`] seam so bootstrap can be driven
//! from a file in production and from an in-memory value in tests.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Environment variable overriding `database.url`.
pub const DATABASE_URL_ENV: &str = "OTWORLD_DATABASE_URL";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not acceptable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// What is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Identity, data locations and world rules.
    #[serde(default)]
    pub server: ServerSection,

    /// Listening ports per protocol.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Autosave and daily server-save settings.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Persistence connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Optional gameplay subsystems.
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl ServerConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// `OTWORLD_DATABASE_URL` overrides `database.url` when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&contents)?;
        config.database.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        // serde_yml rejects an empty document for a struct; treat it as "all defaults".
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "server.name must not be empty".to_owned(),
            });
        }
        if self.server.map_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "server.map_name must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

/// Server identity and world rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerSection {
    /// Display name used in the status protocol and logs.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Public address (IPv4 literal or hostname) advertised to clients.
    #[serde(default = "default_ip")]
    pub ip: String,

    /// Root of the static data tree (items, monsters, map, ...).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Map to load, without extension, looked up under `data_dir/world`.
    #[serde(default = "default_map_name")]
    pub map_name: String,

    /// World ruleset: `pvp`, `no-pvp` or `pvp-enforced`.
    #[serde(default = "default_world_type")]
    pub world_type: String,

    /// Account password hashing: `md5`, `sha1` or `plain`.
    #[serde(default = "default_password_type")]
    pub password_type: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            ip: default_ip(),
            data_dir: default_data_dir(),
            map_name: default_map_name(),
            world_type: default_world_type(),
            password_type: default_password_type(),
        }
    }
}

/// Listening ports. Login, admin and status share a port by default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortsConfig {
    /// Game protocol port.
    #[serde(default = "default_game_port")]
    pub game: u16,

    /// Login protocol port (also carries the legacy login/game protocols).
    #[serde(default = "default_shared_port")]
    pub login: u16,

    /// Admin protocol port.
    #[serde(default = "default_shared_port")]
    pub admin: u16,

    /// Status protocol port.
    #[serde(default = "default_shared_port")]
    pub status: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            game: default_game_port(),
            login: default_shared_port(),
            admin: default_shared_port(),
            status: default_shared_port(),
        }
    }
}

/// Periodic maintenance settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MaintenanceConfig {
    /// Autosave interval in minutes (0 disables autosave).
    #[serde(default)]
    pub auto_save_each_minutes: u32,

    /// Whether the daily server save is scheduled.
    #[serde(default)]
    pub server_save_enabled: bool,

    /// Local hour of day (0-24) the daily server save happens at.
    #[serde(default = "default_server_save_hour")]
    pub server_save_hour: u32,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            auto_save_each_minutes: 0,
            server_save_enabled: false,
            server_save_hour: default_server_save_hour(),
        }
    }
}

/// Persistence connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string handed to the persistence collaborator.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Run table optimization during startup.
    #[serde(default)]
    pub optimize_tables: bool,
}

impl DatabaseConfig {
    /// Override the connection string from `OTWORLD_DATABASE_URL` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(DATABASE_URL_ENV) {
            self.url = val;
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            optimize_tables: false,
        }
    }
}

/// Optional subsystems.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeaturesConfig {
    /// Whether the player market is enabled.
    #[serde(default = "default_true")]
    pub market_enabled: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            market_enabled: true,
        }
    }
}

/// Where bootstrap gets its configuration from.
pub trait ConfigSource: Send {
    /// Produce the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be produced.
    fn load(&self) -> Result<ServerConfig, ConfigError>;

    /// Human-readable origin, for log lines.
    fn describe(&self) -> String;
}

/// Configuration read from a YAML file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Read configuration from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_file(&self.path)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Configuration supplied as a ready value.
#[derive(Debug, Clone)]
pub struct StaticConfigSource(pub ServerConfig);

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        Ok(self.0.clone())
    }

    fn describe(&self) -> String {
        "in-memory configuration".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_server_name() -> String {
    "otworld".to_owned()
}

fn default_ip() -> String {
    "127.0.0.1".to_owned()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_map_name() -> String {
    "forgotten".to_owned()
}

fn default_world_type() -> String {
    "pvp".to_owned()
}

fn default_password_type() -> String {
    "plain".to_owned()
}

const fn default_game_port() -> u16 {
    7172
}

const fn default_shared_port() -> u16 {
    7171
}

const fn default_server_save_hour() -> u32 {
    8
}

fn default_database_url() -> String {
    "data/db".to_owned()
}

const fn default_true() -> bool {
    true
}
