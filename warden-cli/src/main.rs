use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use warden::{HostConfig, HostRunner, LifecycleManager, ZfsStore};

mod commands;

#[derive(Parser)]
#[command(name = "warden", version, about = "Container orchestration for FreeBSD jails")]
struct Cli {
    /// Path to the host configuration file
    #[arg(long, global = true, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a container from a specification file
    Create(commands::create::CreateArgs),
    /// Start a created or stopped container
    Start(commands::start::StartArgs),
    /// Stop a running container
    Stop(commands::stop::StopArgs),
    /// Destroy a stopped container and its dataset
    Destroy(commands::destroy::DestroyArgs),
    /// List containers
    List(commands::list::ListArgs),
    /// Manage partitions
    Partition(commands::partition::PartitionArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading host configuration");
            HostConfig::load(path)?
        }
        None => HostConfig::default(),
    };
    let runner = Arc::new(HostRunner::new());
    let store = Arc::new(ZfsStore::new(runner.clone()));
    let mgr = LifecycleManager::new(config.clone(), store, runner);

    match cli.command {
        Command::Create(args) => commands::create::run(&mgr, args),
        Command::Start(args) => commands::start::run(&mgr, args),
        Command::Stop(args) => commands::stop::run(&mgr, args),
        Command::Destroy(args) => commands::destroy::run(&mgr, args),
        Command::List(args) => commands::list::run(&mgr, args),
        Command::Partition(args) => commands::partition::run(&config, &mgr, args),
    }
}
