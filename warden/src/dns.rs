//! DNS registration. Records live in per-domain files consumed by the
//! resolver; every record carries its owning container uuid so
//! retraction never needs to parse hostnames back apart.
//!
//! File format, one record per line:
//!   local-data: "<fqdn> IN A <ip>" # <uuid>

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};

/// The last three labels of an fqdn form the zone file name;
/// `www.web1.default.warden` and `web1.default.warden` share a file.
pub fn zone_of(fqdn: &str) -> String {
    let labels: Vec<&str> = fqdn.split('.').filter(|l| !l.is_empty()).collect();
    let start = labels.len().saturating_sub(3);
    labels[start..].join(".")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub fqdn: String,
    pub ip: String,
    pub owner: String,
}

impl DnsRecord {
    fn render(&self) -> String {
        format!(
            "local-data: \"{} IN A {}\" # {}",
            self.fqdn, self.ip, self.owner
        )
    }

    fn parse(line: &str) -> Option<DnsRecord> {
        let (data, owner) = line.rsplit_once('#')?;
        let quoted = data.trim().strip_prefix("local-data:")?.trim();
        let inner = quoted.strip_prefix('"')?.strip_suffix('"')?;
        let mut parts = inner.split_whitespace();
        let fqdn = parts.next()?.to_string();
        if parts.next()? != "IN" || parts.next()? != "A" {
            return None;
        }
        let ip = parts.next()?.to_string();
        Some(DnsRecord {
            fqdn,
            ip,
            owner: owner.trim().to_string(),
        })
    }
}

pub struct DnsRegistrar {
    config_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl DnsRegistrar {
    pub fn new(config_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            runner,
        }
    }

    fn zone_file(&self, zone: &str) -> PathBuf {
        self.config_dir.join(zone)
    }

    fn read_zone(&self, zone: &str) -> WardenResult<Vec<DnsRecord>> {
        let path = self.zone_file(zone);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(raw.lines().filter_map(DnsRecord::parse).collect())
    }

    fn write_zone(&self, zone: &str, records: &[DnsRecord]) -> WardenResult<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        let path = self.zone_file(zone);
        if records.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            return Ok(());
        }
        let mut body = String::new();
        for record in records {
            body.push_str(&record.render());
            body.push('\n');
        }
        let tmp = self.config_dir.join(format!(".{}.tmp", zone));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Register an fqdn for a container. An identical record is not
    /// duplicated; the same fqdn with a different address is replaced.
    pub fn register(&self, fqdn: &str, ip: &str, owner: &str) -> WardenResult<()> {
        if fqdn.is_empty() || !fqdn.contains('.') {
            return Err(WardenError::Validation(format!("invalid fqdn {:?}", fqdn)));
        }
        let zone = zone_of(fqdn);
        let mut records = self.read_zone(&zone)?;
        records.retain(|r| !(r.fqdn == fqdn && r.owner == owner));
        records.push(DnsRecord {
            fqdn: fqdn.to_string(),
            ip: ip.to_string(),
            owner: owner.to_string(),
        });
        self.write_zone(&zone, &records)?;
        info!(fqdn, ip, owner, "registered dns record");
        Ok(())
    }

    /// Drop every record a container owns across all zone files.
    pub fn retract_owner(&self, owner: &str) -> WardenResult<()> {
        if !self.config_dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.config_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let zone = match entry.file_name().into_string() {
                Ok(name) if !name.starts_with('.') => name,
                _ => continue,
            };
            let mut records = self.read_zone(&zone)?;
            let before = records.len();
            records.retain(|r| r.owner != owner);
            if records.len() != before {
                self.write_zone(&zone, &records)?;
                info!(owner, zone, removed = before - records.len(), "retracted dns records");
            }
        }
        Ok(())
    }

    pub fn records_for(&self, owner: &str) -> WardenResult<Vec<DnsRecord>> {
        let mut out = Vec::new();
        if !self.config_dir.is_dir() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.config_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Ok(zone) = entry.file_name().into_string() {
                if zone.starts_with('.') {
                    continue;
                }
                out.extend(
                    self.read_zone(&zone)?
                        .into_iter()
                        .filter(|r| r.owner == owner),
                );
            }
        }
        Ok(out)
    }

    /// Reload the resolver so edits take effect. Best-effort; a
    /// resolver that is not running should not fail teardown.
    pub fn reload(&self) {
        let cmd = Cmd::new("service").args(["unbound", "reload"]);
        match self.runner.run(&cmd) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(status = out.status, "resolver reload failed"),
            Err(err) => warn!(%err, "resolver reload failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::HostRunner;

    fn registrar() -> (tempfile::TempDir, DnsRegistrar) {
        let dir = tempfile::tempdir().unwrap();
        let reg = DnsRegistrar::new(dir.path(), Arc::new(HostRunner::new()));
        (dir, reg)
    }

    #[test]
    fn zone_is_last_three_labels() {
        assert_eq!(zone_of("web1.default.warden"), "web1.default.warden");
        assert_eq!(zone_of("www.web1.default.warden"), "web1.default.warden");
        assert_eq!(zone_of("a.b.c.d.e"), "c.d.e");
        assert_eq!(zone_of("warden"), "warden");
    }

    #[test]
    fn register_writes_parseable_record() {
        let (dir, reg) = registrar();
        reg.register("web1.default.warden", "10.99.1.2", "abc12345")
            .unwrap();
        let raw =
            std::fs::read_to_string(dir.path().join("web1.default.warden")).unwrap();
        assert_eq!(
            raw,
            "local-data: \"web1.default.warden IN A 10.99.1.2\" # abc12345\n"
        );
        let records = reg.records_for("abc12345").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip, "10.99.1.2");
    }

    #[test]
    fn reregistration_replaces_address() {
        let (_dir, reg) = registrar();
        reg.register("web1.default.warden", "10.99.1.2", "abc12345")
            .unwrap();
        reg.register("web1.default.warden", "10.99.1.9", "abc12345")
            .unwrap();
        let records = reg.records_for("abc12345").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ip, "10.99.1.9");
    }

    #[test]
    fn retraction_removes_only_owner() {
        let (dir, reg) = registrar();
        reg.register("web1.default.warden", "10.99.1.2", "abc12345")
            .unwrap();
        reg.register("api.default.warden", "10.99.1.3", "zzzz9999")
            .unwrap();
        reg.retract_owner("abc12345").unwrap();
        assert!(reg.records_for("abc12345").unwrap().is_empty());
        assert_eq!(reg.records_for("zzzz9999").unwrap().len(), 1);
        // a fully emptied zone file disappears
        assert!(!dir.path().join("web1.default.warden").exists());
        assert!(dir.path().join("api.default.warden").exists());
    }

    #[test]
    fn invalid_fqdn_is_rejected() {
        let (_dir, reg) = registrar();
        assert!(matches!(
            reg.register("nodots", "10.99.1.2", "abc12345").unwrap_err(),
            WardenError::Validation(_)
        ));
    }
}
