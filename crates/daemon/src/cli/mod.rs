//! Command-line surface.

pub mod setup;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use tenex_domain::config::Config;
use tenex_domain::{Error, Result};

#[derive(Parser)]
#[command(name = "tenex", version, about = "Multi-agent coordination daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (default).
    Daemon {
        /// Comma-separated author pubkeys whose projects to activate,
        /// overriding the configured whitelist.
        #[arg(long, value_delimiter = ',')]
        whitelist: Option<Vec<String>>,
        /// Path to the configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Project helpers.
    #[command(subcommand)]
    Project(ProjectCommand),
    /// Agent store management.
    #[command(subcommand)]
    Agent(AgentCommand),
    /// Interactive LLM provider configuration.
    Setup {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Run a single project from a directory containing `project.json`
    /// (development convenience).
    Run {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List agents in the global store.
    List {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove an agent by pubkey.
    Remove {
        pubkey: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Locate and load the configuration: an explicit `--config` path wins,
/// then `./tenex.toml`, then the user config dir. A missing file means
/// defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<(Config, PathBuf)> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let local = PathBuf::from("tenex.toml");
            if local.exists() {
                local
            } else {
                dirs::config_dir()
                    .map(|d| d.join("tenex").join("tenex.toml"))
                    .unwrap_or(local)
            }
        }
    };

    if !path.exists() {
        if explicit.is_some() {
            return Err(Error::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok((Config::default(), path));
    }

    let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
    let config: Config =
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    Ok((config, path))
}

/// Write the configuration back (used by `setup`).
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let raw = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("serialize config: {e}")))?;
    std::fs::write(path, raw).map_err(Error::Io)?;
    Ok(())
}
