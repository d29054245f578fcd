//! Network provisioning: address allocation under a host-wide lock and
//! epair/bridge attachment of containers.

use std::fs::{File, OpenOptions};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::errors::{WardenError, WardenResult};
use crate::exec::CommandRunner;

pub mod alloc;
pub mod iface;

pub use iface::{EpairLink, IfaceManager, CONTAINER_IFACE};

/// Exclusive host-wide lock taken around address allocation so that
/// concurrent orchestrator invocations cannot pick the same address.
/// Released when dropped.
pub struct AllocationLock {
    file: File,
}

impl AllocationLock {
    pub fn acquire(lock_dir: &Path) -> WardenResult<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join("net-alloc.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(WardenError::Io(std::io::Error::last_os_error()));
        }
        debug!(path = %path.display(), "acquired allocation lock");
        Ok(Self { file })
    }
}

impl Drop for AllocationLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// A fully attached container interface as recorded in the property
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub bridge: String,
    pub host_iface: String,
    pub container_iface: String,
    pub mac: String,
    pub ip4: Ipv4Addr,
    pub cidr: u8,
    pub ip6: Ipv6Addr,
}

impl Attachment {
    /// `<bridge>|<ip>/<cidr>` as stored on the container dataset.
    pub fn ip4_record(&self) -> String {
        format!("{}|{}/{}", self.bridge, self.ip4, self.cidr)
    }

    pub fn ip6_record(&self) -> String {
        format!("{}|{}/{}", self.bridge, self.ip6, self.cidr_ip6())
    }

    fn cidr_ip6(&self) -> u8 {
        // the 6to4 mapping keeps the v4 host width
        96 + self.cidr.min(32)
    }
}

/// Parse a stored `<bridge>|<ip>/<cidr>` record.
pub fn parse_ip4_record(record: &str) -> Option<(String, Ipv4Addr, u8)> {
    let (bridge, rest) = record.split_once('|')?;
    let (ip, cidr) = rest.split_once('/')?;
    Some((bridge.to_string(), ip.parse().ok()?, cidr.parse().ok()?))
}

pub struct NetworkProvisioner {
    iface: IfaceManager,
}

impl NetworkProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            iface: IfaceManager::new(runner),
        }
    }

    /// Wire a running jail onto `bridge` with the given address. The
    /// caller holds the allocation lock and has already picked a free
    /// address; this performs the interface work only.
    pub fn attach(
        &self,
        uuid: &str,
        bridge: &str,
        ip4: Ipv4Addr,
        cidr: u8,
        ip6_override: Option<Ipv6Addr>,
        default_route: Option<Ipv4Addr>,
    ) -> WardenResult<Attachment> {
        let link = self.iface.create_epair()?;

        let mut rng = StdRng::from_os_rng();
        let host_mac = alloc::random_mac(&mut rng);
        let container_mac = alloc::random_mac(&mut rng);
        self.iface.set_mac(&link.host_side, &host_mac)?;
        self.iface.set_mac(&link.container_side, &container_mac)?;

        self.iface.set_description(&link.host_side, uuid)?;
        self.iface.add_to_bridge(bridge, &link.host_side)?;
        self.iface.up(&link.host_side)?;

        let container_iface = self.iface.move_into_jail(&link.container_side, uuid)?;
        self.iface.assign_ip4(uuid, &container_iface, ip4, cidr)?;

        let ip6 = ip6_override.unwrap_or_else(|| alloc::derive_ip6(ip4));
        self.iface
            .assign_ip6(uuid, &container_iface, ip6, 96 + cidr.min(32))?;

        if let Some(gateway) = default_route {
            self.iface.add_default_route(uuid, gateway)?;
        }

        info!(uuid, bridge, %ip4, "attached container to bridge");
        Ok(Attachment {
            bridge: bridge.to_string(),
            host_iface: link.host_side,
            container_iface,
            mac: container_mac,
            ip4,
            cidr,
            ip6,
        })
    }

    /// Static route inside the jail, used by publicly bridged
    /// containers to still reach the private network.
    pub fn add_net_route(
        &self,
        uuid: &str,
        network: Ipv4Addr,
        cidr: u8,
        gateway: Ipv4Addr,
    ) -> WardenResult<()> {
        self.iface.add_net_route(uuid, network, cidr, gateway)
    }

    /// Tear down the host side of an attachment. The container side
    /// dies with the jail's vnet. A link that is already gone is not
    /// an error.
    pub fn detach(&self, host_iface: &str) -> WardenResult<()> {
        if !self.iface.exists(host_iface)? {
            debug!(iface = %host_iface, "host interface already gone");
            return Ok(());
        }
        self.iface.destroy(host_iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip4_record_round_trips() {
        let attachment = Attachment {
            bridge: "bridge1".into(),
            host_iface: "epair0a".into(),
            container_iface: "vnet0".into(),
            mac: "02:00:00:00:00:01".into(),
            ip4: Ipv4Addr::new(10, 99, 1, 2),
            cidr: 16,
            ip6: alloc::derive_ip6(Ipv4Addr::new(10, 99, 1, 2)),
        };
        let record = attachment.ip4_record();
        assert_eq!(record, "bridge1|10.99.1.2/16");
        assert_eq!(
            parse_ip4_record(&record),
            Some(("bridge1".to_string(), Ipv4Addr::new(10, 99, 1, 2), 16))
        );
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert_eq!(parse_ip4_record("10.99.1.2/16"), None);
        assert_eq!(parse_ip4_record("bridge1|10.99.1.2"), None);
        assert_eq!(parse_ip4_record("bridge1|nope/16"), None);
    }

    #[test]
    fn allocation_lock_is_reentrant_across_drops() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = AllocationLock::acquire(dir.path()).unwrap();
        }
        let _lock = AllocationLock::acquire(dir.path()).unwrap();
    }
}
