use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;
use clap::Args;

use warden::container::StartOptions;
use warden::LifecycleManager;

use super::resolve_container;

#[derive(Args)]
pub struct StartArgs {
    /// Container name or uuid
    pub container: String,

    #[arg(long, default_value = "default")]
    pub partition: String,

    /// Bridge to attach to instead of the private default
    #[arg(long)]
    pub bridge: Option<String>,

    /// Fixed IPv4 address instead of pool allocation
    #[arg(long)]
    pub ip4: Option<Ipv4Addr>,

    /// Prefix length for the assigned address
    #[arg(long)]
    pub cidr: Option<u8>,

    /// Fixed IPv6 address instead of the 6to4-derived one
    #[arg(long)]
    pub ip6: Option<Ipv6Addr>,
}

pub fn run(mgr: &LifecycleManager, args: StartArgs) -> Result<()> {
    let uuid = resolve_container(mgr, &args.partition, &args.container)?;
    let opts = StartOptions {
        bridge: args.bridge,
        ip4: args.ip4,
        cidr: args.cidr,
        ip6: args.ip6,
    };
    mgr.start(&args.partition, &uuid, &opts)?;
    println!("started {}", uuid);
    Ok(())
}
