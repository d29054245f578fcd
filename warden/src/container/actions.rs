//! On-create action execution inside a freshly started container.
//!
//! Actions run in declared order. installPackage borrows the host
//! package cache via a read-only nullfs mount for the duration of the
//! install; the cache is unmounted even when the install fails.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::HostConfig;
use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};
use crate::jail::JailController;

use super::Action;

/// Deadline for in-jail package installs, which routinely fetch and
/// extract for far longer than the default command timeout.
pub const PKG_INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// A hook run after a package install succeeds, keyed by a package
/// name pattern. Kept as a registry so service-specific workarounds do
/// not grow into special cases inside the executor.
pub struct PostInstallHook {
    pub name: &'static str,
    pub matches: fn(&str) -> bool,
    pub run: fn(&ActionContext<'_>, &str) -> WardenResult<()>,
}

fn postgres_matches(package: &str) -> bool {
    package.contains("postgresql") && package.contains("-server")
}

/// The stock postgres packages create their `pgsql` user with a fixed
/// UID that collides across containers sharing uid-sensitive storage.
/// Remap it to a UID derived from the low two octets of the primary
/// address, probing upward past any UID already taken, then re-own
/// anything the old UID still owns.
fn postgres_remap(ctx: &ActionContext<'_>, package: &str) -> WardenResult<()> {
    let octets = ctx.primary_ip.octets();
    let mut uid: u32 = format!("70{}{}", octets[2], octets[3])
        .parse()
        .map_err(|_| WardenError::Internal("uid derivation overflow".into()))?;
    loop {
        match ctx.jail.exec(ctx.uuid, &["pw", "usershow", "-u", &uid.to_string()]) {
            Ok(_) => uid += 1,
            Err(WardenError::CommandFailed { .. }) => break,
            Err(err) => return Err(err),
        }
    }
    info!(uuid = ctx.uuid, package, uid, "remapping pgsql uid");
    ctx.jail.exec(
        ctx.uuid,
        &["pw", "usermod", "pgsql", "-u", &uid.to_string()],
    )?;
    ctx.jail
        .exec(ctx.uuid, &["find", "/", "-user", "70", "-exec", "chown", "-h", "pgsql", "{}", ";"])?;
    Ok(())
}

pub fn default_hooks() -> Vec<PostInstallHook> {
    vec![PostInstallHook {
        name: "postgres-uid-remap",
        matches: postgres_matches,
        run: postgres_remap,
    }]
}

pub struct ActionContext<'a> {
    pub uuid: &'a str,
    pub primary_ip: Ipv4Addr,
    pub container_root: &'a Path,
    /// partition-level persistent data area
    pub partition_data_dir: &'a Path,
    /// directory the specification was loaded from, for relative
    /// fileFolderMapping sources
    pub source_dir: Option<&'a Path>,
    pub jail: &'a JailController,
}

pub struct ActionRunner {
    config: HostConfig,
    runner: Arc<dyn CommandRunner>,
    hooks: Vec<PostInstallHook>,
}

impl ActionRunner {
    pub fn new(config: HostConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            hooks: default_hooks(),
        }
    }

    pub fn run_all(&self, ctx: &ActionContext<'_>, actions: &[Action]) -> WardenResult<()> {
        for action in actions {
            self.run_one(ctx, action)?;
        }
        Ok(())
    }

    fn run_one(&self, ctx: &ActionContext<'_>, action: &Action) -> WardenResult<()> {
        match action {
            Action::Exec { value } => {
                info!(uuid = ctx.uuid, command = %value, "running exec action");
                ctx.jail.exec(ctx.uuid, &["/bin/sh", "-c", value])?;
                Ok(())
            }
            Action::InstallPackage { value } => self.install_package(ctx, value),
            Action::FileFolderMapping { source, target } => {
                self.file_folder_mapping(ctx, source, target)
            }
            Action::PersistentStorage { value } => Err(WardenError::Unimplemented(format!(
                "persistentStorage action (requested {:?})",
                value
            ))),
            Action::Unknown => {
                warn!(uuid = ctx.uuid, "skipping unknown container action");
                Ok(())
            }
        }
    }

    fn install_package(&self, ctx: &ActionContext<'_>, package: &str) -> WardenResult<()> {
        let cache_target = ctx.container_root.join("var/cache/pkg");
        std::fs::create_dir_all(&cache_target)?;

        let cache_src = self.config.pkg_cache_dir.display().to_string();
        let target = cache_target.display().to_string();
        let mount = Cmd::new("mount_nullfs").args(["-o", "ro", &cache_src, &target]);
        self.runner.run_checked(&mount)?;

        info!(uuid = ctx.uuid, package, "installing package");
        let install = ctx.jail.exec_with_timeout(
            ctx.uuid,
            &["env", "ASSUME_ALWAYS_YES=yes", "pkg", "install", "-y", package],
            PKG_INSTALL_TIMEOUT,
        );

        // unmount no matter how the install went
        let umount = Cmd::new("umount").args(["-f", &target]);
        if let Err(err) = self.runner.run_checked(&umount) {
            warn!(uuid = ctx.uuid, %err, "could not unmount package cache");
        }
        install?;

        for hook in &self.hooks {
            if (hook.matches)(package) {
                info!(uuid = ctx.uuid, hook = hook.name, package, "running post-install hook");
                (hook.run)(ctx, package)?;
            }
        }
        Ok(())
    }

    /// Copy a file or directory into the container. Sources starting
    /// with `partition/` resolve against the partition data area; the
    /// rest resolve against the specification source directory.
    fn file_folder_mapping(
        &self,
        ctx: &ActionContext<'_>,
        source: &str,
        target: &str,
    ) -> WardenResult<()> {
        let src: PathBuf = if let Some(rest) = source.strip_prefix("partition/") {
            ctx.partition_data_dir.join(rest)
        } else {
            match ctx.source_dir {
                Some(dir) => dir.join(source),
                None => {
                    return Err(WardenError::Validation(format!(
                        "relative source {:?} with no source directory",
                        source
                    )))
                }
            }
        };
        if !src.exists() {
            return Err(WardenError::NotFound(format!(
                "mapping source {}",
                src.display()
            )));
        }
        let target_rel = target.trim_start_matches('/');
        let dst = ctx.container_root.join(target_rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(uuid = ctx.uuid, source = %src.display(), target = %dst.display(), "mapping file");
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
        Ok(())
    }
}

fn copy_dir(src: &Path, dst: &Path) -> WardenResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src) {
        let entry =
            entry.map_err(|e| WardenError::Internal(format!("walking {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WardenError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CmdOutput;
    use parking_lot::Mutex;

    /// Records every command; `pw usershow` fails so UID probing stops
    /// on the first candidate, everything else succeeds.
    struct RecordingRunner {
        calls: Mutex<Vec<Cmd>>,
    }

    impl RecordingRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, cmd: &Cmd) -> crate::errors::WardenResult<CmdOutput> {
            self.calls.lock().push(cmd.clone());
            let status = if cmd.args.iter().any(|a| a == "usershow") {
                67
            } else {
                0
            };
            Ok(CmdOutput {
                status,
                ..CmdOutput::default()
            })
        }
    }

    fn install_fixture() -> (Arc<RecordingRunner>, JailController, ActionRunner, tempfile::TempDir)
    {
        let runner = Arc::new(RecordingRunner::new());
        let jail = JailController::new(runner.clone());
        let mut config = HostConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        config.pkg_cache_dir = tmp.path().join("pkg-cache");
        std::fs::create_dir_all(&config.pkg_cache_dir).unwrap();
        let actions = ActionRunner::new(config, runner.clone());
        (runner, jail, actions, tmp)
    }

    #[test]
    fn package_installs_get_a_long_deadline() {
        let (runner, jail, actions, tmp) = install_fixture();
        let ctx = ActionContext {
            uuid: "abc12345",
            primary_ip: Ipv4Addr::new(10, 99, 1, 2),
            container_root: tmp.path(),
            partition_data_dir: tmp.path(),
            source_dir: None,
            jail: &jail,
        };
        actions
            .run_one(&ctx, &Action::InstallPackage { value: "nginx".into() })
            .unwrap();
        let calls = runner.calls.lock();
        let install = calls
            .iter()
            .find(|c| c.program == "jexec" && c.args.iter().any(|a| a == "install"))
            .expect("pkg install was issued");
        assert_eq!(install.timeout, PKG_INSTALL_TIMEOUT);
        // the cache mount bookends stay on the default deadline
        assert!(calls.iter().any(|c| c.program == "mount_nullfs"));
        assert!(calls.iter().any(|c| c.program == "umount"));
    }

    #[test]
    fn postgres_install_remaps_the_pgsql_user() {
        let (runner, jail, actions, tmp) = install_fixture();
        let ctx = ActionContext {
            uuid: "abc12345",
            primary_ip: Ipv4Addr::new(10, 99, 12, 34),
            container_root: tmp.path(),
            partition_data_dir: tmp.path(),
            source_dir: None,
            jail: &jail,
        };
        actions
            .run_one(
                &ctx,
                &Action::InstallPackage {
                    value: "postgresql95-server".into(),
                },
            )
            .unwrap();
        let calls = runner.calls.lock();
        let usermod = calls
            .iter()
            .find(|c| c.args.iter().any(|a| a == "usermod"))
            .expect("uid remap ran");
        assert!(usermod.args.iter().any(|a| a == "pgsql"));
        assert!(usermod.args.iter().any(|a| a == "701234"));
        let reown = calls
            .iter()
            .find(|c| c.args.iter().any(|a| a == "find"))
            .expect("re-own ran");
        assert!(reown.args.iter().any(|a| a == "pgsql"));
    }

    #[test]
    fn postgres_pattern_matches_server_packages() {
        assert!(postgres_matches("postgresql95-server"));
        assert!(postgres_matches("postgresql-server"));
        assert!(!postgres_matches("postgresql95-client"));
        assert!(!postgres_matches("nginx"));
    }

    #[test]
    fn mapping_without_source_dir_fails_validation() {
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::exec::HostRunner::new());
        let jail = JailController::new(runner.clone());
        let actions = ActionRunner::new(HostConfig::default(), runner);
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ActionContext {
            uuid: "abc12345",
            primary_ip: Ipv4Addr::new(10, 99, 1, 2),
            container_root: tmp.path(),
            partition_data_dir: tmp.path(),
            source_dir: None,
            jail: &jail,
        };
        let err = actions
            .run_one(
                &ctx,
                &Action::FileFolderMapping {
                    source: "www".into(),
                    target: "/usr/local/www".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }

    #[test]
    fn partition_sources_copy_from_data_dir() {
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::exec::HostRunner::new());
        let jail = JailController::new(runner.clone());
        let actions = ActionRunner::new(HostConfig::default(), runner);
        let data = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(data.path().join("www")).unwrap();
        std::fs::write(data.path().join("www/index.html"), "hi").unwrap();
        let ctx = ActionContext {
            uuid: "abc12345",
            primary_ip: Ipv4Addr::new(10, 99, 1, 2),
            container_root: root.path(),
            partition_data_dir: data.path(),
            source_dir: None,
            jail: &jail,
        };
        actions
            .run_one(
                &ctx,
                &Action::FileFolderMapping {
                    source: "partition/www".into(),
                    target: "/usr/local/www".into(),
                },
            )
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("usr/local/www/index.html")).unwrap(),
            "hi"
        );
    }

    #[test]
    fn persistent_storage_fails_loudly() {
        let runner: Arc<dyn CommandRunner> = Arc::new(crate::exec::HostRunner::new());
        let jail = JailController::new(runner.clone());
        let actions = ActionRunner::new(HostConfig::default(), runner);
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ActionContext {
            uuid: "abc12345",
            primary_ip: Ipv4Addr::new(10, 99, 1, 2),
            container_root: tmp.path(),
            partition_data_dir: tmp.path(),
            source_dir: None,
            jail: &jail,
        };
        let err = actions
            .run_one(
                &ctx,
                &Action::PersistentStorage {
                    value: "pgdata".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, WardenError::Unimplemented(_)));
    }
}
