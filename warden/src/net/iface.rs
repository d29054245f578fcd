//! Host-side interface plumbing: epair creation, vnet handoff, bridge
//! membership and in-container route setup. Everything funnels through
//! the command runner so the whole module is scriptable in tests.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::debug;

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};
use crate::jail::jail_name;

/// Canonical in-container interface name. The host-side half keeps its
/// epair name.
pub const CONTAINER_IFACE: &str = "vnet0";

/// A provisioned epair: `host_side` stays on the host bridge,
/// `container_side` has been moved into the jail and renamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpairLink {
    pub host_side: String,
    pub container_side: String,
}

/// Swap the trailing a/b of an epair member name.
pub fn peer_name(member: &str) -> WardenResult<String> {
    let (stem, suffix) = member.split_at(member.len().saturating_sub(1));
    match suffix {
        "a" => Ok(format!("{}b", stem)),
        "b" => Ok(format!("{}a", stem)),
        _ => Err(WardenError::Internal(format!(
            "not an epair member name: {}",
            member
        ))),
    }
}

pub struct IfaceManager {
    runner: Arc<dyn CommandRunner>,
}

impl IfaceManager {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn ifconfig(&self, args: &[&str]) -> WardenResult<String> {
        let cmd = Cmd::new("ifconfig").args(args.iter().copied());
        self.runner.run_checked(&cmd).map(|out| out.stdout)
    }

    /// Create an epair; `ifconfig epair create` prints the a-side name.
    pub fn create_epair(&self) -> WardenResult<EpairLink> {
        let out = self.ifconfig(&["epair", "create"])?;
        let a_side = out.trim().to_string();
        if a_side.is_empty() {
            return Err(WardenError::Internal(
                "ifconfig epair create returned no interface name".into(),
            ));
        }
        let b_side = peer_name(&a_side)?;
        debug!(host = %a_side, container = %b_side, "created epair");
        Ok(EpairLink {
            host_side: a_side,
            container_side: b_side,
        })
    }

    pub fn set_mac(&self, iface: &str, mac: &str) -> WardenResult<()> {
        self.ifconfig(&[iface, "ether", mac]).map(|_| ())
    }

    pub fn set_description(&self, iface: &str, uuid: &str) -> WardenResult<()> {
        let text = format!("Connected to container {}", uuid);
        self.ifconfig(&[iface, "description", &text]).map(|_| ())
    }

    pub fn add_to_bridge(&self, bridge: &str, iface: &str) -> WardenResult<()> {
        self.ifconfig(&[bridge, "addm", iface, "up"]).map(|_| ())
    }

    pub fn up(&self, iface: &str) -> WardenResult<()> {
        self.ifconfig(&[iface, "up"]).map(|_| ())
    }

    /// Does the interface currently exist on the host?
    pub fn exists(&self, iface: &str) -> WardenResult<bool> {
        let cmd = Cmd::new("ifconfig").arg(iface);
        Ok(self.runner.run(&cmd)?.success())
    }

    pub fn destroy(&self, iface: &str) -> WardenResult<()> {
        self.ifconfig(&[iface, "destroy"]).map(|_| ())
    }

    /// Hand the container side of a link into the jail's vnet and give
    /// it the canonical name.
    pub fn move_into_jail(&self, iface: &str, uuid: &str) -> WardenResult<String> {
        let name = jail_name(uuid);
        self.ifconfig(&[iface, "vnet", &name])?;
        self.jexec_ifconfig(uuid, &[iface, "name", CONTAINER_IFACE])?;
        Ok(CONTAINER_IFACE.to_string())
    }

    pub fn assign_ip4(
        &self,
        uuid: &str,
        iface: &str,
        ip: Ipv4Addr,
        cidr: u8,
    ) -> WardenResult<()> {
        let addr = format!("{}/{}", ip, cidr);
        self.jexec_ifconfig(uuid, &[iface, "inet", &addr, "up"])
    }

    pub fn assign_ip6(
        &self,
        uuid: &str,
        iface: &str,
        ip: Ipv6Addr,
        prefix_len: u8,
    ) -> WardenResult<()> {
        let addr = format!("{}/{}", ip, prefix_len);
        self.jexec_ifconfig(uuid, &[iface, "inet6", &addr, "up"])
    }

    pub fn add_default_route(&self, uuid: &str, gateway: Ipv4Addr) -> WardenResult<()> {
        let gw = gateway.to_string();
        let cmd = Cmd::new("jexec").args([&jail_name(uuid), "route", "add", "default", &gw]);
        self.runner.run_checked(&cmd).map(|_| ())
    }

    /// Static route to a network, installed inside the jail.
    pub fn add_net_route(
        &self,
        uuid: &str,
        network: Ipv4Addr,
        cidr: u8,
        gateway: Ipv4Addr,
    ) -> WardenResult<()> {
        let net = format!("{}/{}", network, cidr);
        let gw = gateway.to_string();
        let cmd = Cmd::new("jexec").args([&jail_name(uuid), "route", "add", "-net", &net, &gw]);
        self.runner.run_checked(&cmd).map(|_| ())
    }

    fn jexec_ifconfig(&self, uuid: &str, args: &[&str]) -> WardenResult<()> {
        let name = jail_name(uuid);
        let mut cmd = Cmd::new("jexec").arg(&name).arg("ifconfig");
        for part in args {
            cmd = cmd.arg(*part);
        }
        self.runner.run_checked(&cmd).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_name_swaps_suffix() {
        assert_eq!(peer_name("epair0a").unwrap(), "epair0b");
        assert_eq!(peer_name("epair12b").unwrap(), "epair12a");
    }

    #[test]
    fn peer_name_rejects_non_epair() {
        assert!(peer_name("em0").is_err());
        assert!(peer_name("").is_err());
    }
}
