//! Generated in-container files: rc.conf, resolv.conf, the firewall
//! bootstrap script and the on-stop script.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::errors::{WardenError, WardenResult};

use super::Action;

/// In-container path of the generated ruleset; rc.conf points the
/// packet filter at it.
pub const IPFW_RULES_JAIL_PATH: &str = "/usr/local/etc/ipfw.rules";
pub const ONSTOP_SCRIPT_JAIL_PATH: &str = "/etc/rc.onstop";

pub fn render_rc_conf(hostname: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("hostname=\"{}\"\n", hostname));
    out.push_str("sendmail_enable=\"NONE\"\n");
    out.push_str("syslogd_flags=\"-ss\"\n");
    out.push_str("firewall_enable=\"YES\"\n");
    out.push_str(&format!("firewall_script=\"{}\"\n", IPFW_RULES_JAIL_PATH));
    out
}

pub fn render_resolv_conf(search_domain: &str, dns_servers: &[Ipv4Addr]) -> String {
    let mut out = format!("search {}\n", search_domain);
    for server in dns_servers {
        out.push_str(&format!("nameserver {}\n", server));
    }
    out
}

/// Initial ruleset shipped at create time, before any rules are
/// synthesized: it only prepares the in-container filesystems the
/// firewall and package tooling expect.
pub fn render_firewall_bootstrap() -> String {
    let mut out = String::from("#!/bin/sh\n");
    out.push_str("mount -t devfs devfs /dev\n");
    out.push_str("mount -t tmpfs tmpfs /tmp\n");
    out.push_str("chmod 777 /tmp\n");
    out
}

/// One line per declared on-stop exec action. Non-exec actions have no
/// meaning at stop time and are rejected up front.
pub fn render_onstop_script(actions: &[Action]) -> WardenResult<String> {
    let mut out = String::from("#!/bin/sh\n");
    for action in actions {
        match action {
            Action::Exec { value } => {
                out.push_str(value);
                out.push('\n');
            }
            other => {
                return Err(WardenError::Validation(format!(
                    "unsupported on-stop action {:?}",
                    other
                )))
            }
        }
    }
    Ok(out)
}

/// Write a generated script with owner-only rwx.
pub fn write_script(path: &Path, content: &str) -> WardenResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

/// Write a plain generated config file.
pub fn write_file(path: &Path, content: &str) -> WardenResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_conf_enables_firewall() {
        let rc = render_rc_conf("web1.default.warden");
        assert!(rc.contains("hostname=\"web1.default.warden\"\n"));
        assert!(rc.contains("firewall_enable=\"YES\"\n"));
        assert!(rc.contains(IPFW_RULES_JAIL_PATH));
    }

    #[test]
    fn resolv_conf_lists_servers_in_order() {
        let resolv = render_resolv_conf(
            "default.warden",
            &[Ipv4Addr::new(10, 99, 255, 254), Ipv4Addr::new(8, 8, 8, 8)],
        );
        assert_eq!(
            resolv,
            "search default.warden\nnameserver 10.99.255.254\nnameserver 8.8.8.8\n"
        );
    }

    #[test]
    fn onstop_script_lists_exec_actions() {
        let actions = vec![
            Action::Exec {
                value: "service nginx stop".into(),
            },
            Action::Exec {
                value: "rm -f /tmp/ready".into(),
            },
        ];
        let script = render_onstop_script(&actions).unwrap();
        assert_eq!(
            script,
            "#!/bin/sh\nservice nginx stop\nrm -f /tmp/ready\n"
        );
    }

    #[test]
    fn onstop_rejects_non_exec_actions() {
        let actions = vec![Action::InstallPackage {
            value: "nginx".into(),
        }];
        assert!(render_onstop_script(&actions).is_err());
    }

    #[test]
    fn scripts_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etc/rc.onstop");
        write_script(&path, "#!/bin/sh\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
