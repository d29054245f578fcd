//! ZFS-backed property store.
//!
//! Dataset user properties are the durable namespace; every query goes
//! through the typed command runner so failures carry the exact `zfs`
//! invocation. ZFS reports an unset user property as `-`, which maps to
//! `Ok(None)`; a failed `zfs` invocation maps to `StoreUnavailable`.

use std::path::Path;
use std::sync::Arc;

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};

use super::{ArrayLocks, PropertyStore};

pub struct ZfsStore {
    runner: Arc<dyn CommandRunner>,
    array_locks: ArrayLocks,
}

impl ZfsStore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            array_locks: ArrayLocks::new(),
        }
    }

    fn zfs(&self, args: &[&str]) -> WardenResult<String> {
        let cmd = Cmd::new("zfs").args(args.iter().copied());
        let out = self.runner.run(&cmd)?;
        if !out.success() {
            return Err(WardenError::StoreUnavailable(format!(
                "`{}` exited {}: {}",
                cmd.display(),
                out.status,
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    /// All `property\tvalue` pairs on a dataset, one per line.
    fn all_props(&self, dataset: &str) -> WardenResult<Vec<(String, String)>> {
        let raw = self.zfs(&["get", "-H", "-o", "property,value", "all", dataset])?;
        Ok(raw
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, char::is_whitespace);
                let key = parts.next()?.trim().to_string();
                let value = parts.next()?.trim().to_string();
                Some((key, value))
            })
            .collect())
    }

    fn array_entries(&self, dataset: &str, array: &str) -> WardenResult<Vec<(usize, String)>> {
        let prefix = format!("{}:", array);
        let mut entries: Vec<(usize, String)> = self
            .all_props(dataset)?
            .into_iter()
            .filter_map(|(key, value)| {
                let index = key.strip_prefix(&prefix)?.parse::<usize>().ok()?;
                if value == "-" {
                    None
                } else {
                    Some((index, value))
                }
            })
            .collect();
        entries.sort_by_key(|(index, _)| *index);
        Ok(entries)
    }
}

impl PropertyStore for ZfsStore {
    fn get(&self, dataset: &str, key: &str) -> WardenResult<Option<String>> {
        let out = self.zfs(&["get", "-H", "-o", "value", key, dataset])?;
        let value = out.trim();
        if value.is_empty() || value == "-" {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    fn set(&self, dataset: &str, key: &str, value: &str) -> WardenResult<()> {
        let assignment = format!("{}={}", key, if value.is_empty() { "-" } else { value });
        self.zfs(&["set", &assignment, dataset]).map(|_| ())
    }

    fn unset(&self, dataset: &str, key: &str) -> WardenResult<()> {
        self.zfs(&["inherit", "-r", key, dataset]).map(|_| ())
    }

    fn get_recursive(&self, dataset: &str, key: &str) -> WardenResult<Vec<String>> {
        let out = self.zfs(&["get", "-H", "-o", "value", "-r", key, dataset])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "-")
            .map(str::to_string)
            .collect())
    }

    fn append_array(&self, dataset: &str, array: &str, value: &str) -> WardenResult<()> {
        let lock = self.array_locks.for_key(dataset, array);
        let _guard = lock.lock();

        let next = self
            .array_entries(dataset, array)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        self.set(dataset, &format!("{}:{}", array, next), value)
    }

    fn get_array(&self, dataset: &str, array: &str) -> WardenResult<Vec<(usize, String)>> {
        self.array_entries(dataset, array)
    }

    fn unset_array(&self, dataset: &str, array: &str) -> WardenResult<()> {
        let lock = self.array_locks.for_key(dataset, array);
        let _guard = lock.lock();

        for (index, _) in self.array_entries(dataset, array)? {
            self.unset(dataset, &format!("{}:{}", array, index))?;
        }
        Ok(())
    }

    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool> {
        let cmd = Cmd::new("zfs").args(["list", dataset]);
        Ok(self.runner.run(&cmd)?.success())
    }

    fn create_dataset(&self, dataset: &str, mountpoint: &Path) -> WardenResult<()> {
        let mp = format!("mountpoint={}", mountpoint.display());
        self.zfs(&["create", "-pu", "-o", &mp, dataset]).map(|_| ())
    }

    fn destroy_dataset(&self, dataset: &str) -> WardenResult<()> {
        self.zfs(&["destroy", "-rf", dataset]).map(|_| ())
    }

    fn rename_dataset(&self, from: &str, to: &str, mountpoint: &Path) -> WardenResult<()> {
        self.zfs(&["rename", from, to])?;
        // the new mountpoint inherits down to children
        let mp = format!("mountpoint={}", mountpoint.display());
        self.zfs(&["set", &mp, to]).map(|_| ())
    }

    fn mount_dataset(&self, dataset: &str) -> WardenResult<()> {
        self.zfs(&["mount", dataset]).map(|_| ())
    }

    fn unmount_dataset(&self, dataset: &str, force: bool) -> WardenResult<()> {
        if force {
            self.zfs(&["umount", "-f", dataset]).map(|_| ())
        } else {
            self.zfs(&["umount", dataset]).map(|_| ())
        }
    }

    fn list_children(&self, dataset: &str) -> WardenResult<Vec<String>> {
        let out = self.zfs(&["list", "-H", "-o", "name", "-r", "-d", "1", dataset])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != dataset)
            .map(str::to_string)
            .collect())
    }
}
