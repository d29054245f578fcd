//! ipfw rendering and application.
//!
//! The generated per-container script is the single source of rule
//! text. apply() is read-compute-write-reload under a host-wide lock;
//! a failed reload leaves the previous file untouched because the new
//! content only lands via rename.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};
use crate::jail::jail_name;

use super::{Direction, Endpoint, PortSpec, Rule};

/// Membership for the three per-container tables, keyed by table id.
pub type TableMembers = BTreeMap<u8, Vec<String>>;

fn endpoint_text(endpoint: &Endpoint) -> String {
    match endpoint {
        Endpoint::Any => "any".to_string(),
        Endpoint::Addr(addr) => addr.to_string(),
        Endpoint::Table(id) => format!("'table({})'", id),
        Endpoint::Loopback => "127.0.0.0/8".to_string(),
    }
}

fn rule_text(rule: &Rule) -> String {
    let mut text = format!(
        "add allow {} from {} to {}",
        rule.proto.as_str(),
        endpoint_text(&rule.src),
        endpoint_text(&rule.dst),
    );
    if let PortSpec::Ports(ports) = &rule.ports {
        let list: Vec<String> = ports.iter().map(u16::to_string).collect();
        text.push(' ');
        text.push_str(&list.join(","));
    }
    match rule.direction {
        Direction::In => text.push_str(" in"),
        Direction::Out => text.push_str(" out"),
    }
    text
}

/// Render the full per-container ruleset script: flush, table
/// membership, allow rules in precedence order, deny tail.
pub fn render_script(rules: &[Rule], tables: &TableMembers) -> String {
    let mut out = String::from("#!/bin/sh\nipfw -f flush\nipfw -f table all flush\n");
    for (table, members) in tables {
        for member in members {
            out.push_str(&format!("ipfw table {} add {}\n", table, member));
        }
    }
    for rule in rules {
        out.push_str("ipfw ");
        out.push_str(&rule_text(rule));
        out.push('\n');
    }
    out.push_str("ipfw add deny ip from any to any\n");
    out
}

/// Host-wide lock around every firewall apply. Rule files are
/// read-modify-written wholesale, so concurrent invocations must
/// serialize.
struct ApplyLock {
    file: File,
}

impl ApplyLock {
    fn acquire(lock_dir: &Path) -> WardenResult<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join("firewall.lock");
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(WardenError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl Drop for ApplyLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

pub struct ContainerFirewall {
    runner: Arc<dyn CommandRunner>,
    lock_dir: std::path::PathBuf,
}

impl ContainerFirewall {
    pub fn new(runner: Arc<dyn CommandRunner>, lock_dir: &Path) -> Self {
        Self {
            runner,
            lock_dir: lock_dir.to_path_buf(),
        }
    }

    /// Atomically replace the container's ruleset and reload it inside
    /// the jail. `host_path` is where the script lives on the host
    /// filesystem, `jail_path` the same file as the jail sees it.
    pub fn apply(
        &self,
        uuid: &str,
        host_path: &Path,
        jail_path: &str,
        rules: &[Rule],
        tables: &TableMembers,
    ) -> WardenResult<()> {
        let _lock = ApplyLock::acquire(&self.lock_dir)?;

        let script = render_script(rules, tables);
        write_atomic(host_path, &script)?;
        debug!(uuid, path = %host_path.display(), rules = rules.len(), "wrote ruleset");

        let cmd = Cmd::new("jexec").args([&jail_name(uuid), "/bin/sh", jail_path]);
        let out = self.runner.run(&cmd)?;
        if !out.success() {
            return Err(WardenError::ApplyFailed(format!(
                "ruleset reload for {} exited {}: {}",
                uuid,
                out.status,
                out.stderr.trim()
            )));
        }
        info!(uuid, "applied container firewall");
        Ok(())
    }

    /// Live table membership update inside the jail. Rule text is not
    /// touched.
    pub fn table_add(&self, uuid: &str, table: u8, member: &str) -> WardenResult<()> {
        let t = table.to_string();
        let cmd = Cmd::new("jexec").args([&jail_name(uuid), "ipfw", "table", &t, "add", member]);
        self.runner.run_checked(&cmd).map(|_| ())
    }

    pub fn table_remove(&self, uuid: &str, table: u8, member: &str) -> WardenResult<()> {
        let t = table.to_string();
        let cmd = Cmd::new("jexec").args([&jail_name(uuid), "ipfw", "table", &t, "delete", member]);
        self.runner.run_checked(&cmd).map(|_| ())
    }
}

/// Host-level tables for publicly bridged containers: table 1 holds
/// their addresses, table 2 their host-side interfaces.
pub struct HostFirewall {
    runner: Arc<dyn CommandRunner>,
}

impl HostFirewall {
    pub const TABLE_PUBLIC_IPS: u8 = 1;
    pub const TABLE_PUBLIC_IFACES: u8 = 2;

    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn register_public(&self, ip: &str, host_iface: &str) -> WardenResult<()> {
        self.table("add", Self::TABLE_PUBLIC_IPS, ip)?;
        self.table("add", Self::TABLE_PUBLIC_IFACES, host_iface)
    }

    /// Best-effort removal; a member that is already gone is reported
    /// but not fatal.
    pub fn deregister_public(&self, ip: &str, host_iface: &str) {
        if let Err(err) = self.table("delete", Self::TABLE_PUBLIC_IPS, ip) {
            warn!(ip, %err, "could not remove address from public table");
        }
        if let Err(err) = self.table("delete", Self::TABLE_PUBLIC_IFACES, host_iface) {
            warn!(host_iface, %err, "could not remove interface from public table");
        }
    }

    fn table(&self, verb: &str, table: u8, member: &str) -> WardenResult<()> {
        let t = table.to_string();
        let cmd = Cmd::new("ipfw").args(["table", &t, verb, member]);
        self.runner.run_checked(&cmd).map(|_| ())
    }
}

fn write_atomic(path: &Path, content: &str) -> WardenResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| WardenError::Internal(format!("no parent dir for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("ruleset")
    ));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::{Proto, TABLE_GROUP_PEERS};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn script_renders_tables_then_rules_then_deny() {
        let mut tables = TableMembers::new();
        tables.insert(TABLE_GROUP_PEERS, vec!["10.99.1.3".to_string()]);
        let rules = vec![Rule::inbound(
            Proto::Tcp,
            Endpoint::Table(TABLE_GROUP_PEERS),
            Endpoint::Addr(IpAddr::V4(Ipv4Addr::new(10, 99, 1, 2))),
            PortSpec::Ports(vec![80, 443]),
        )];
        let script = render_script(&rules, &tables);
        let table_line = script.find("ipfw table 1 add 10.99.1.3").unwrap();
        let rule_line = script
            .find("ipfw add allow tcp from 'table(1)' to 10.99.1.2 80,443 in")
            .unwrap();
        let deny_line = script.find("ipfw add deny ip from any to any").unwrap();
        assert!(table_line < rule_line);
        assert!(rule_line < deny_line);
        assert!(script.starts_with("#!/bin/sh\n"));
    }

    #[test]
    fn any_ports_render_without_port_list() {
        let rule = Rule::outbound(
            Proto::Ip,
            Endpoint::Loopback,
            Endpoint::Loopback,
            PortSpec::Any,
        );
        assert_eq!(
            rule_text(&rule),
            "add allow ip from 127.0.0.0/8 to 127.0.0.0/8 out"
        );
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipfw.rules");
        write_atomic(&path, "first\n").unwrap();
        write_atomic(&path, "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");
        assert!(!dir.path().join(".ipfw.rules.tmp").exists());
    }
}
