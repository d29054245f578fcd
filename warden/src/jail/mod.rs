//! FreeBSD jail control: parameter resolution, create/remove, liveness
//! probing and in-jail command execution via jexec.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};

/// Jail name prefix; the visible jail id for uuid `abc12345` is
/// `trd-abc12345`.
pub const JAIL_NAME_PREFIX: &str = "trd-";

pub fn jail_name(uuid: &str) -> String {
    format!("{}{}", JAIL_NAME_PREFIX, uuid)
}

/// Tunable jail(8) parameters with host-wide defaults. Containers may
/// override individual keys; unknown override keys are warned about and
/// dropped rather than passed through to jail(8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JailParams {
    pub securelevel: String,
    pub devfs_ruleset: String,
    pub enforce_statfs: String,
    pub children_max: String,
    pub allow_set_hostname: String,
    pub allow_sysvipc: String,
    pub allow_raw_sockets: String,
    pub allow_chflags: String,
    pub allow_mount: String,
    pub allow_mount_devfs: String,
    pub allow_mount_nullfs: String,
    pub allow_mount_procfs: String,
    pub allow_mount_tmpfs: String,
    pub allow_mount_zfs: String,
    pub allow_quotas: String,
    pub allow_socket_af: String,
    pub exec_prestart: String,
    pub exec_poststart: String,
    pub exec_prestop: String,
    pub exec_start: String,
    pub exec_stop: String,
    pub exec_clean: String,
    pub exec_timeout: String,
    pub exec_fib: String,
    pub stop_timeout: String,
    pub mount_devfs: String,
    pub mount_fdescfs: String,
    pub ip4: String,
    pub ip4_saddrsel: String,
}

impl Default for JailParams {
    fn default() -> Self {
        Self {
            securelevel: "2".into(),
            devfs_ruleset: "4".into(),
            enforce_statfs: "2".into(),
            children_max: "0".into(),
            allow_set_hostname: "0".into(),
            allow_sysvipc: "0".into(),
            allow_raw_sockets: "0".into(),
            allow_chflags: "0".into(),
            allow_mount: "0".into(),
            allow_mount_devfs: "0".into(),
            allow_mount_nullfs: "0".into(),
            allow_mount_procfs: "0".into(),
            allow_mount_tmpfs: "0".into(),
            allow_mount_zfs: "0".into(),
            allow_quotas: "0".into(),
            allow_socket_af: "0".into(),
            exec_prestart: String::new(),
            exec_poststart: String::new(),
            exec_prestop: String::new(),
            exec_start: "/bin/sh /etc/rc".into(),
            exec_stop: "/bin/sh /etc/rc.shutdown".into(),
            exec_clean: "1".into(),
            exec_timeout: "60".into(),
            exec_fib: "0".into(),
            stop_timeout: "30".into(),
            mount_devfs: "1".into(),
            mount_fdescfs: "1".into(),
            ip4: "new".into(),
            ip4_saddrsel: "1".into(),
        }
    }
}

impl JailParams {
    /// jail(8) option name -> value, in a stable order.
    pub fn as_options(&self) -> Vec<(&'static str, String)> {
        vec![
            ("securelevel", self.securelevel.clone()),
            ("devfs_ruleset", self.devfs_ruleset.clone()),
            ("enforce_statfs", self.enforce_statfs.clone()),
            ("children.max", self.children_max.clone()),
            ("allow.set_hostname", self.allow_set_hostname.clone()),
            ("allow.sysvipc", self.allow_sysvipc.clone()),
            ("allow.raw_sockets", self.allow_raw_sockets.clone()),
            ("allow.chflags", self.allow_chflags.clone()),
            ("allow.mount", self.allow_mount.clone()),
            ("allow.mount.devfs", self.allow_mount_devfs.clone()),
            ("allow.mount.nullfs", self.allow_mount_nullfs.clone()),
            ("allow.mount.procfs", self.allow_mount_procfs.clone()),
            ("allow.mount.tmpfs", self.allow_mount_tmpfs.clone()),
            ("allow.mount.zfs", self.allow_mount_zfs.clone()),
            ("allow.quotas", self.allow_quotas.clone()),
            ("allow.socket_af", self.allow_socket_af.clone()),
            ("exec.prestart", self.exec_prestart.clone()),
            ("exec.poststart", self.exec_poststart.clone()),
            ("exec.prestop", self.exec_prestop.clone()),
            ("exec.start", self.exec_start.clone()),
            ("exec.stop", self.exec_stop.clone()),
            ("exec.clean", self.exec_clean.clone()),
            ("exec.timeout", self.exec_timeout.clone()),
            ("exec.fib", self.exec_fib.clone()),
            ("stop.timeout", self.stop_timeout.clone()),
            ("mount.devfs", self.mount_devfs.clone()),
            ("mount.fdescfs", self.mount_fdescfs.clone()),
            ("ip4", self.ip4.clone()),
            ("ip4.saddrsel", self.ip4_saddrsel.clone()),
        ]
    }

    /// Apply per-container overrides keyed by jail(8) option name.
    /// Unknown keys are logged and skipped.
    pub fn resolve(&self, overrides: &BTreeMap<String, String>) -> JailParams {
        let mut resolved = self.clone();
        for (key, value) in overrides {
            let slot = match key.as_str() {
                "securelevel" => &mut resolved.securelevel,
                "devfs_ruleset" => &mut resolved.devfs_ruleset,
                "enforce_statfs" => &mut resolved.enforce_statfs,
                "children.max" => &mut resolved.children_max,
                "allow.set_hostname" => &mut resolved.allow_set_hostname,
                "allow.sysvipc" => &mut resolved.allow_sysvipc,
                "allow.raw_sockets" => &mut resolved.allow_raw_sockets,
                "allow.chflags" => &mut resolved.allow_chflags,
                "allow.mount" => &mut resolved.allow_mount,
                "allow.mount.devfs" => &mut resolved.allow_mount_devfs,
                "allow.mount.nullfs" => &mut resolved.allow_mount_nullfs,
                "allow.mount.procfs" => &mut resolved.allow_mount_procfs,
                "allow.mount.tmpfs" => &mut resolved.allow_mount_tmpfs,
                "allow.mount.zfs" => &mut resolved.allow_mount_zfs,
                "allow.quotas" => &mut resolved.allow_quotas,
                "allow.socket_af" => &mut resolved.allow_socket_af,
                "exec.prestart" => &mut resolved.exec_prestart,
                "exec.poststart" => &mut resolved.exec_poststart,
                "exec.prestop" => &mut resolved.exec_prestop,
                "exec.start" => &mut resolved.exec_start,
                "exec.stop" => &mut resolved.exec_stop,
                "exec.clean" => &mut resolved.exec_clean,
                "exec.timeout" => &mut resolved.exec_timeout,
                "exec.fib" => &mut resolved.exec_fib,
                "stop.timeout" => &mut resolved.stop_timeout,
                "mount.devfs" => &mut resolved.mount_devfs,
                "mount.fdescfs" => &mut resolved.mount_fdescfs,
                "ip4" => &mut resolved.ip4,
                "ip4.saddrsel" => &mut resolved.ip4_saddrsel,
                other => {
                    warn!(option = other, "ignoring unknown jail option override");
                    continue;
                }
            };
            *slot = value.clone();
        }
        resolved
    }
}

/// Result of probing a jail with jls. `Unknown` means the probe itself
/// failed; callers that refuse work on running containers must also
/// refuse on `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    NotRunning,
    Unknown,
}

pub struct JailController {
    runner: Arc<dyn CommandRunner>,
}

impl JailController {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn liveness(&self, uuid: &str) -> Liveness {
        let cmd = Cmd::new("jls").args(["-j", &jail_name(uuid)]);
        match self.runner.run(&cmd) {
            Ok(out) if out.success() => Liveness::Running,
            // jls exits non-zero when no such jail exists.
            Ok(_) => Liveness::NotRunning,
            Err(err) => {
                warn!(uuid, %err, "liveness probe failed");
                Liveness::Unknown
            }
        }
    }

    /// Create a persistent vnet jail rooted at `root`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        uuid: &str,
        hostname: &str,
        domainname: &str,
        root: &Path,
        console_log: &Path,
        fstab: &Path,
        params: &JailParams,
    ) -> WardenResult<()> {
        let name = jail_name(uuid);
        debug!(uuid, %hostname, "creating jail {}", name);

        let mut cmd = Cmd::new("jail").args(["-c", "vnet"]);
        cmd = cmd
            .arg(format!("name={}", name))
            .arg(format!("host.hostname={}", hostname))
            .arg(format!("host.domainname={}", domainname))
            .arg(format!("host.hostuuid={}", uuid))
            .arg(format!("path={}", root.display()))
            .arg(format!("exec.consolelog={}", console_log.display()))
            .arg(format!("mount.fstab={}", fstab.display()))
            .arg("allow.dying")
            .arg("persist");
        for (option, value) in params.as_options() {
            if value.is_empty() {
                continue;
            }
            cmd = cmd.arg(format!("{}={}", option, value));
        }

        self.runner.run_checked(&cmd).map(|_| ())
    }

    pub fn remove(&self, uuid: &str) -> WardenResult<()> {
        let cmd = Cmd::new("jail").args(["-r", &jail_name(uuid)]);
        self.runner.run_checked(&cmd).map(|_| ())
    }

    /// Run a command inside the jail. Non-zero exit becomes
    /// `CommandFailed` with the jail-side stderr attached.
    pub fn exec(&self, uuid: &str, argv: &[&str]) -> WardenResult<String> {
        self.exec_with_timeout(uuid, argv, crate::exec::DEFAULT_TIMEOUT)
    }

    /// `exec` with an explicit deadline, for in-jail work that
    /// legitimately outlives the default one.
    pub fn exec_with_timeout(
        &self,
        uuid: &str,
        argv: &[&str],
        timeout: std::time::Duration,
    ) -> WardenResult<String> {
        if argv.is_empty() {
            return Err(WardenError::Validation("empty command for jexec".into()));
        }
        let mut cmd = Cmd::new("jexec").arg(jail_name(uuid));
        for part in argv {
            cmd = cmd.arg(*part);
        }
        cmd = cmd.timeout(timeout);
        self.runner.run_checked(&cmd).map(|out| out.stdout)
    }
}
