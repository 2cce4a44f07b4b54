use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tenex_daemon::agents::AgentStore;
use tenex_daemon::cli::{self, AgentCommand, Cli, Command, ProjectCommand};
use tenex_daemon::daemon::Daemon;
use tenex_relay::{RelayClient, RelayPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to the daemon when no subcommand is given.
        None => run_daemon(None, None).await,
        Some(Command::Daemon { whitelist, config }) => {
            run_daemon(whitelist, config.as_deref()).await
        }
        Some(Command::Project(ProjectCommand::Run { path, config })) => {
            run_single_project(&path, config.as_deref()).await
        }
        Some(Command::Agent(AgentCommand::List { config })) => {
            let (config, _) = cli::load_config(config.as_deref())?;
            let store = AgentStore::open(&config.data.agents_dir())?;
            for agent in store.list() {
                let def = &agent.definition;
                println!(
                    "{:<16} {:<20} {} {}",
                    def.slug,
                    def.role,
                    def.pubkey,
                    if agent.can_sign() { "" } else { "(no key)" },
                );
            }
            Ok(())
        }
        Some(Command::Agent(AgentCommand::Remove { pubkey, config })) => {
            let (config, _) = cli::load_config(config.as_deref())?;
            let store = AgentStore::open(&config.data.agents_dir())?;
            if store.remove(&pubkey)? {
                println!("removed {pubkey}");
            } else {
                println!("no agent with pubkey {pubkey}");
            }
            Ok(())
        }
        Some(Command::Setup { config }) => {
            let (loaded, path) = cli::load_config(config.as_deref())?;
            cli::setup::run(loaded, &path)?;
            Ok(())
        }
    }
}

/// Structured JSON tracing for long-running modes.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tenex_daemon=debug")),
        )
        .json()
        .init();
}

async fn run_daemon(
    whitelist: Option<Vec<String>>,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    init_tracing();
    let (config, _) = cli::load_config(config_path)?;
    let config = Arc::new(config);

    tracing::info!(
        relays = config.relays.urls.len(),
        data_root = %config.data.root.display(),
        "TENEX starting"
    );
    let relay: Arc<dyn RelayClient> = Arc::new(RelayPool::connect(&config.relays.urls));
    let daemon =
        Daemon::new(config, relay, whitelist).context("daemon initialization failed")?;
    daemon.run().await.context("daemon exited with error")?;
    Ok(())
}

async fn run_single_project(path: &Path, config_path: Option<&Path>) -> anyhow::Result<()> {
    init_tracing();
    let (config, _) = cli::load_config(config_path)?;
    let config = Arc::new(config);

    let raw = std::fs::read_to_string(path.join("project.json"))
        .with_context(|| format!("reading {}/project.json", path.display()))?;
    let definition = serde_json::from_str(&raw).context("parsing project.json")?;

    let relay: Arc<dyn RelayClient> = Arc::new(RelayPool::connect(&config.relays.urls));
    let mut daemon =
        Daemon::new(config, relay, Some(Vec::new())).context("daemon initialization failed")?;
    daemon.deps().subscriptions.start();
    daemon.deps().subscriptions.refresh().await?;
    daemon.activate(definition).await;

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("interrupt received, shutting down");
    daemon.shutdown().await;
    Ok(())
}
