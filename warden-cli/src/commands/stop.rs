use anyhow::Result;
use clap::Args;

use warden::LifecycleManager;

use super::resolve_container;

#[derive(Args)]
pub struct StopArgs {
    /// Container name or uuid
    pub container: String,

    #[arg(long, default_value = "default")]
    pub partition: String,
}

pub fn run(mgr: &LifecycleManager, args: StopArgs) -> Result<()> {
    let uuid = resolve_container(mgr, &args.partition, &args.container)?;
    mgr.stop(&args.partition, &uuid)?;
    println!("stopped {}", uuid);
    Ok(())
}
