//! World rule identifiers resolved from configuration during bootstrap.

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// World type
// ---------------------------------------------------------------------------

/// PvP ruleset of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldType {
    /// Players may attack each other with penalties.
    Pvp,
    /// Players cannot attack each other.
    NoPvp,
    /// Unrestricted PvP without penalties.
    PvpEnforced,
}

impl WorldType {
    /// Every recognised configuration identifier, in display order.
    pub const IDENTIFIERS: [&'static str; 3] = ["pvp", "no-pvp", "pvp-enforced"];

    /// Configuration identifier for this ruleset.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pvp => "pvp",
            Self::NoPvp => "no-pvp",
            Self::PvpEnforced => "pvp-enforced",
        }
    }
}

impl fmt::Display for WorldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A world type identifier that is not one of [`WorldType::IDENTIFIERS`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown world type {value:?}, valid world types are: pvp, no-pvp and pvp-enforced")]
pub struct UnknownWorldType {
    /// The offending configuration value.
    pub value: String,
}

impl FromStr for WorldType {
    type Err = UnknownWorldType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("pvp") {
            Ok(Self::Pvp)
        } else if trimmed.eq_ignore_ascii_case("no-pvp") {
            Ok(Self::NoPvp)
        } else if trimmed.eq_ignore_ascii_case("pvp-enforced") {
            Ok(Self::PvpEnforced)
        } else {
            Err(UnknownWorldType {
                value: s.to_owned(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// How account passwords are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PasswordType {
    /// Stored as given.
    #[default]
    Plain,
    /// MD5 hex digest.
    Md5,
    /// SHA-1 hex digest.
    Sha1,
}

impl PasswordType {
    /// Resolve a configuration value. Unrecognised values fall back to
    /// [`PasswordType::Plain`]; the second field reports whether that
    /// happened.
    pub fn resolve(value: &str) -> (Self, bool) {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("md5") {
            (Self::Md5, false)
        } else if trimmed.eq_ignore_ascii_case("sha1") {
            (Self::Sha1, false)
        } else if trimmed.eq_ignore_ascii_case("plain") {
            (Self::Plain, false)
        } else {
            (Self::Plain, true)
        }
    }
}

impl fmt::Display for PasswordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
        })
    }
}

// ---------------------------------------------------------------------------
// Game state and protocols
// ---------------------------------------------------------------------------

/// Coarse game state the world collaborator is told about during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GameState {
    /// Loading static data; no map yet.
    Startup,
    /// Map loaded; maintenance being registered.
    Init,
    /// Fully started.
    Normal,
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Init => "init",
            Self::Normal => "normal",
        })
    }
}

/// A network protocol the service registry can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// In-game protocol.
    Game,
    /// Character list / login protocol.
    Login,
    /// Legacy login protocol for old clients.
    OldLogin,
    /// Legacy game protocol for old clients.
    OldGame,
    /// Remote administration protocol.
    Admin,
    /// Server status queries.
    Status,
}

impl Protocol {
    /// Short protocol name for logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Game => "game",
            Self::Login => "login",
            Self::OldLogin => "old-login",
            Self::OldGame => "old-game",
            Self::Admin => "admin",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A protocol bound to a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceBinding {
    /// The protocol served.
    pub protocol: Protocol,
    /// TCP port it listens on.
    pub port: u16,
}

impl fmt::Display for ServiceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol, self.port)
    }
}
