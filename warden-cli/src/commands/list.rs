use anyhow::Result;
use clap::Args;
use comfy_table::{presets::UTF8_FULL, Table};

use warden::{Container, ContainerState, LifecycleManager};

#[derive(Args)]
pub struct ListArgs {
    /// Limit to one partition
    #[arg(long)]
    pub partition: Option<String>,
}

pub fn run(mgr: &LifecycleManager, args: ListArgs) -> Result<()> {
    let partitions = match &args.partition {
        Some(partition) => vec![partition.clone()],
        None => mgr.host().partitions()?,
    };

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["UUID", "NAME", "PARTITION", "STATE", "IPV4"]);

    for partition in partitions {
        for dataset in mgr.host().container_datasets(&partition)? {
            let container = Container::load(mgr.host().store(), &dataset)?;
            let state = mgr
                .state(&partition, &container.uuid)
                .unwrap_or(ContainerState::Unprovisioned);
            let ip = container
                .interfaces
                .first()
                .map(|i| i.ip4.to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row([
                container.uuid.clone(),
                container.name.clone(),
                partition.clone(),
                state.to_string(),
                ip,
            ]);
        }
    }
    println!("{table}");
    Ok(())
}
