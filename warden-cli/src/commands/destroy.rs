use anyhow::Result;
use clap::Args;

use warden::LifecycleManager;

use super::resolve_container;

#[derive(Args)]
pub struct DestroyArgs {
    /// Container name or uuid
    pub container: String,

    #[arg(long, default_value = "default")]
    pub partition: String,
}

pub fn run(mgr: &LifecycleManager, args: DestroyArgs) -> Result<()> {
    let uuid = resolve_container(mgr, &args.partition, &args.container)?;
    mgr.destroy(&args.partition, &uuid)?;
    println!("destroyed {}", uuid);
    Ok(())
}
