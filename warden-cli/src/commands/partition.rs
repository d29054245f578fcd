use anyhow::{bail, Result};
use clap::{Args, Subcommand};

use warden::partition::PartitionManager;
use warden::{ContainerState, HostConfig, LifecycleManager};

#[derive(Args)]
pub struct PartitionArgs {
    #[command(subcommand)]
    command: PartitionCommand,
}

#[derive(Subcommand)]
enum PartitionCommand {
    /// Create a new partition
    Create { name: String },
    /// Rename a partition; all of its containers must be stopped
    Rename { from: String, to: String },
    /// Show or edit a partition's ip4 whitelist
    Whitelist {
        name: String,
        /// Address or CIDR to append
        #[arg(long)]
        add: Option<String>,
        /// Remove every whitelist entry
        #[arg(long)]
        clear: bool,
    },
}

pub fn run(config: &HostConfig, mgr: &LifecycleManager, args: PartitionArgs) -> Result<()> {
    let partitions = PartitionManager::new(config.clone(), mgr.host().store().clone());
    match args.command {
        PartitionCommand::Create { name } => {
            partitions.create(&name)?;
            println!("created partition {}", name);
        }
        PartitionCommand::Rename { from, to } => {
            for dataset in mgr.host().container_datasets(&from)? {
                let uuid = dataset.rsplit('/').next().unwrap_or_default();
                let state = mgr.state(&from, uuid)?;
                if state == ContainerState::Running {
                    bail!("container {} in partition {} is running", uuid, from);
                }
            }
            partitions.rename(&from, &to)?;
            println!("renamed partition {} to {}", from, to);
        }
        PartitionCommand::Whitelist { name, add, clear } => {
            if clear {
                partitions.whitelist_clear(&name)?;
            }
            if let Some(addr) = add {
                partitions.whitelist_add(&name, &addr)?;
            }
            for entry in partitions.whitelist(&name)? {
                println!("{}", entry);
            }
        }
    }
    Ok(())
}
