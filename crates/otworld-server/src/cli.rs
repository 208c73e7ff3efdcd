//! Command-line arguments.
//!
//! Options here override the configuration file; logging options never
//! come from the file since logging is up before the file is read.

use std::path::PathBuf;

use clap::Parser;
use otworld_core::config::{ConfigError, ConfigSource, FileConfigSource, ServerConfig};

/// Command line arguments for the game server.
#[derive(Debug, Clone, Parser)]
#[command(name = "otworld-server", version, about = "otworld game server")]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, value_name = "FILE", default_value = "otworld-config.yaml")]
    pub config: PathBuf,

    /// Override `server.data_dir` from the configuration file.
    #[arg(short, long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    /// The configuration source described by these arguments.
    pub fn config_source(&self) -> CliConfigSource {
        CliConfigSource {
            file: FileConfigSource::new(&self.config),
            data_dir: self.data_dir.clone(),
        }
    }
}

/// Configuration file with command-line overrides applied on top.
#[derive(Debug, Clone)]
pub struct CliConfigSource {
    file: FileConfigSource,
    data_dir: Option<PathBuf>,
}

impl ConfigSource for CliConfigSource {
    fn load(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = self.file.load()?;
        if let Some(dir) = &self.data_dir {
            config.server.data_dir.clone_from(dir);
        }
        Ok(config)
    }

    fn describe(&self) -> String {
        match &self.data_dir {
            Some(dir) => format!("{} (data dir {})", self.file.describe(), dir.display()),
            None => self.file.describe(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["otworld-server"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("otworld-config.yaml"));
        assert!(cli.data_dir.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn data_dir_overrides_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otworld-config.yaml");
        std::fs::write(&path, "server:\n  data_dir: \"/from/file\"\n").unwrap();

        let cli = Cli::try_parse_from([
            "otworld-server",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/from/cli",
            "--json-logs",
        ])
        .unwrap();
        assert!(cli.json_logs);

        let config = cli.config_source().load().unwrap();
        assert_eq!(config.server.data_dir, PathBuf::from("/from/cli"));
    }
}
