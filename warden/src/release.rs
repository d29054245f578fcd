//! Release filesystems: the read-only base directories a container
//! borrows from its release, and the template files copied into a
//! fresh container root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::HostConfig;
use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};

/// Directories nullfs-mounted read-only from the release into every
/// container.
pub const BASE_DIRS: &[&str] = &[
    "bin",
    "boot",
    "lib",
    "libexec",
    "rescue",
    "sbin",
    "usr/bin",
    "usr/include",
    "usr/lib",
    "usr/libexec",
    "usr/sbin",
    "usr/share",
    "usr/src",
];

/// Directories copied (not mounted) from the release template into the
/// container root so the container can mutate them.
pub const TEMPLATE_DIRS: &[&str] = &["etc", "root", "var"];

/// Host files copied verbatim into a fresh container.
pub const HOST_FILES: &[&str] = &["/etc/localtime"];

pub struct ReleaseFilesystem {
    config: HostConfig,
    runner: Arc<dyn CommandRunner>,
}

impl ReleaseFilesystem {
    pub fn new(config: HostConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn exists(&self, release: &str) -> bool {
        self.config.release_root(release).is_dir()
    }

    /// fstab lines for the read-only base mounts, consumed by the jail
    /// at start.
    pub fn fstab_lines(&self, release: &str, container_root: &Path) -> Vec<String> {
        let release_root = self.config.release_root(release);
        BASE_DIRS
            .iter()
            .map(|dir| {
                format!(
                    "{} {} nullfs ro 0 0",
                    release_root.join(dir).display(),
                    container_root.join(dir).display()
                )
            })
            .collect()
    }

    /// Create the mount targets for the base directories inside a new
    /// container root.
    pub fn create_mountpoints(&self, container_root: &Path) -> WardenResult<()> {
        for dir in BASE_DIRS {
            std::fs::create_dir_all(container_root.join(dir))?;
        }
        Ok(())
    }

    /// Copy the mutable template directories of a release into the
    /// container root, preserving structure and symlinks as files.
    pub fn populate(&self, release: &str, container_root: &Path) -> WardenResult<()> {
        let release_root = self.config.release_root(release);
        if !release_root.is_dir() {
            return Err(WardenError::NotFound(format!(
                "release {} at {}",
                release,
                release_root.display()
            )));
        }
        for dir in TEMPLATE_DIRS {
            let src_base = release_root.join(dir);
            if !src_base.is_dir() {
                continue;
            }
            copy_tree(&src_base, &container_root.join(dir))?;
        }
        for file in HOST_FILES {
            let src = PathBuf::from(file);
            if !src.is_file() {
                continue;
            }
            let rel = src.strip_prefix("/").unwrap_or(&src);
            let dst = container_root.join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }
        debug!(release, root = %container_root.display(), "populated container root");
        Ok(())
    }

    /// Unmount every nullfs base mount. `devfs` is not ours to touch
    /// here.
    pub fn unmount_base_dirs(&self, container_root: &Path) -> WardenResult<()> {
        // reverse order so nested mounts come off first
        for dir in BASE_DIRS.iter().rev() {
            let target = container_root.join(dir).display().to_string();
            let cmd = Cmd::new("umount").args(["-f", &target]);
            // a dir that was never mounted fails umount; tolerated
            let _ = self.runner.run(&cmd)?;
        }
        Ok(())
    }
}

fn copy_tree(src: &Path, dst: &Path) -> WardenResult<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            WardenError::Internal(format!("walking {}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WardenError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_structure() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("etc/rc.d")).unwrap();
        std::fs::write(src.path().join("etc/hosts"), "::1 localhost\n").unwrap();
        std::fs::write(src.path().join("etc/rc.d/netif"), "#!/bin/sh\n").unwrap();

        copy_tree(&src.path().join("etc"), &dst.path().join("etc")).unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("etc/hosts")).unwrap(),
            "::1 localhost\n"
        );
        assert!(dst.path().join("etc/rc.d/netif").is_file());
    }

    #[test]
    fn fstab_lines_are_read_only_nullfs() {
        let fs = ReleaseFilesystem::new(
            HostConfig::default(),
            Arc::new(crate::exec::HostRunner::new()),
        );
        let lines = fs.fstab_lines("11.0-RELEASE", Path::new("/warden/ptn/default/cntr/abc"));
        assert_eq!(lines.len(), BASE_DIRS.len());
        assert!(lines[0].contains("nullfs ro 0 0"));
        assert!(lines[0].contains("11.0-RELEASE"));
    }
}
