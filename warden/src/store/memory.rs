//! In-memory property store used by tests and dry runs.
//!
//! Datasets are keyed by name; `/`-prefixed matching gives the same
//! parent/child behavior as a real pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::errors::{WardenError, WardenResult};

use super::{ArrayLocks, PropertyStore};

#[derive(Debug, Default)]
struct Dataset {
    mountpoint: Option<PathBuf>,
    mounted: bool,
    props: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    datasets: Mutex<BTreeMap<String, Dataset>>,
    array_locks: ArrayLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mountpoint a dataset was created with, if any. Test helper.
    pub fn mountpoint_of(&self, dataset: &str) -> Option<PathBuf> {
        self.datasets
            .lock()
            .get(dataset)
            .and_then(|d| d.mountpoint.clone())
    }

    pub fn is_mounted(&self, dataset: &str) -> bool {
        self.datasets
            .lock()
            .get(dataset)
            .map(|d| d.mounted)
            .unwrap_or(false)
    }

    fn descendants(datasets: &BTreeMap<String, Dataset>, dataset: &str) -> Vec<String> {
        let prefix = format!("{}/", dataset);
        datasets
            .keys()
            .filter(|name| name.as_str() == dataset || name.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

impl PropertyStore for MemoryStore {
    fn get(&self, dataset: &str, key: &str) -> WardenResult<Option<String>> {
        Ok(self
            .datasets
            .lock()
            .get(dataset)
            .and_then(|d| d.props.get(key).cloned()))
    }

    fn set(&self, dataset: &str, key: &str, value: &str) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        let ds = datasets
            .get_mut(dataset)
            .ok_or_else(|| WardenError::NotFound(format!("dataset {}", dataset)))?;
        ds.props.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn unset(&self, dataset: &str, key: &str) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        if let Some(ds) = datasets.get_mut(dataset) {
            ds.props.remove(key);
        }
        Ok(())
    }

    fn get_recursive(&self, dataset: &str, key: &str) -> WardenResult<Vec<String>> {
        let datasets = self.datasets.lock();
        Ok(Self::descendants(&datasets, dataset)
            .into_iter()
            .filter_map(|name| datasets.get(&name).and_then(|d| d.props.get(key).cloned()))
            .collect())
    }

    fn append_array(&self, dataset: &str, array: &str, value: &str) -> WardenResult<()> {
        let lock = self.array_locks.for_key(dataset, array);
        let _guard = lock.lock();

        let next = self
            .get_array(dataset, array)?
            .last()
            .map(|(index, _)| index + 1)
            .unwrap_or(0);
        self.set(dataset, &format!("{}:{}", array, next), value)
    }

    fn get_array(&self, dataset: &str, array: &str) -> WardenResult<Vec<(usize, String)>> {
        let prefix = format!("{}:", array);
        let datasets = self.datasets.lock();
        let mut entries: Vec<(usize, String)> = datasets
            .get(dataset)
            .map(|d| {
                d.props
                    .iter()
                    .filter_map(|(key, value)| {
                        let index = key.strip_prefix(&prefix)?.parse::<usize>().ok()?;
                        Some((index, value.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|(index, _)| *index);
        Ok(entries)
    }

    fn unset_array(&self, dataset: &str, array: &str) -> WardenResult<()> {
        let lock = self.array_locks.for_key(dataset, array);
        let _guard = lock.lock();

        let prefix = format!("{}:", array);
        let mut datasets = self.datasets.lock();
        if let Some(ds) = datasets.get_mut(dataset) {
            ds.props.retain(|key, _| !key.starts_with(&prefix));
        }
        Ok(())
    }

    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool> {
        Ok(self.datasets.lock().contains_key(dataset))
    }

    fn create_dataset(&self, dataset: &str, mountpoint: &Path) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        // zfs create -p: materialize missing ancestors too.
        let mut path = String::new();
        for part in dataset.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            datasets.entry(path.clone()).or_default();
        }
        let ds = datasets.entry(dataset.to_string()).or_default();
        ds.mountpoint = Some(mountpoint.to_path_buf());
        Ok(())
    }

    fn destroy_dataset(&self, dataset: &str) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        if !datasets.contains_key(dataset) {
            return Err(WardenError::NotFound(format!("dataset {}", dataset)));
        }
        for name in Self::descendants(&datasets, dataset) {
            datasets.remove(&name);
        }
        Ok(())
    }

    fn rename_dataset(&self, from: &str, to: &str, mountpoint: &Path) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        if !datasets.contains_key(from) {
            return Err(WardenError::NotFound(format!("dataset {}", from)));
        }
        if datasets.contains_key(to) {
            return Err(WardenError::StateConflict(format!(
                "dataset {} already exists",
                to
            )));
        }
        let old_mount = datasets.get(from).and_then(|d| d.mountpoint.clone());
        let child_prefix = format!("{}/", from);
        for name in Self::descendants(&datasets, from) {
            let mut ds = match datasets.remove(&name) {
                Some(ds) => ds,
                None => continue,
            };
            let renamed = if name == from {
                ds.mountpoint = Some(mountpoint.to_path_buf());
                to.to_string()
            } else {
                // child mountpoints follow the parent's new mountpoint
                if let (Some(old_root), Some(mp)) = (old_mount.as_ref(), ds.mountpoint.take()) {
                    ds.mountpoint = mp
                        .strip_prefix(old_root)
                        .map(|rest| mountpoint.join(rest))
                        .ok()
                        .or(Some(mp));
                }
                match name.strip_prefix(&child_prefix) {
                    Some(rest) => format!("{}/{}", to, rest),
                    None => name.clone(),
                }
            };
            datasets.insert(renamed, ds);
        }
        Ok(())
    }

    fn mount_dataset(&self, dataset: &str) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        let ds = datasets
            .get_mut(dataset)
            .ok_or_else(|| WardenError::NotFound(format!("dataset {}", dataset)))?;
        ds.mounted = true;
        Ok(())
    }

    fn unmount_dataset(&self, dataset: &str, _force: bool) -> WardenResult<()> {
        let mut datasets = self.datasets.lock();
        if let Some(ds) = datasets.get_mut(dataset) {
            ds.mounted = false;
        }
        Ok(())
    }

    fn list_children(&self, dataset: &str) -> WardenResult<Vec<String>> {
        let prefix = format!("{}/", dataset);
        let datasets = self.datasets.lock();
        Ok(datasets
            .keys()
            .filter(|name| {
                name.strip_prefix(&prefix)
                    .map(|rest| !rest.contains('/'))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{array_prop, keys, prop};
    use std::path::PathBuf;

    fn store_with(dataset: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_dataset(dataset, &PathBuf::from("/mnt"))
            .unwrap();
        store
    }

    #[test]
    fn get_set_round_trip() {
        let store = store_with("zroot/warden/ptn/default/cntr/abc12345");
        let key = prop(keys::NAME);
        store
            .set("zroot/warden/ptn/default/cntr/abc12345", &key, "web1")
            .unwrap();
        assert_eq!(
            store
                .get("zroot/warden/ptn/default/cntr/abc12345", &key)
                .unwrap()
                .as_deref(),
            Some("web1")
        );
    }

    #[test]
    fn append_assigns_increasing_indexes() {
        let store = store_with("zroot/a");
        let array = array_prop(keys::TCP_IN_PORTS);
        store.append_array("zroot/a", &array, "80").unwrap();
        store.append_array("zroot/a", &array, "443").unwrap();
        let entries = store.get_array("zroot/a", &array).unwrap();
        assert_eq!(
            entries,
            vec![(0, "80".to_string()), (1, "443".to_string())]
        );
    }

    #[test]
    fn append_skips_past_sparse_gaps() {
        let store = store_with("zroot/a");
        let array = array_prop(keys::REGISTERED_DNS_NAMES);
        store.set("zroot/a", &format!("{}:5", array), "db.warden").unwrap();
        store.append_array("zroot/a", &array, "web.warden").unwrap();
        let entries = store.get_array("zroot/a", &array).unwrap();
        assert_eq!(entries[1], (6, "web.warden".to_string()));
    }

    #[test]
    fn destroy_removes_descendants() {
        let store = store_with("zroot/warden/ptn/default/cntr/abc12345");
        assert!(store.dataset_exists("zroot/warden/ptn/default").unwrap());
        store.destroy_dataset("zroot/warden/ptn/default").unwrap();
        assert!(!store.dataset_exists("zroot/warden/ptn/default").unwrap());
        assert!(!store
            .dataset_exists("zroot/warden/ptn/default/cntr/abc12345")
            .unwrap());
        assert!(store.dataset_exists("zroot/warden/ptn").unwrap());
    }

    #[test]
    fn rename_moves_children_and_mountpoints() {
        let store = MemoryStore::new();
        store
            .create_dataset("zroot/warden/ptn/old", &PathBuf::from("/warden/ptn/old"))
            .unwrap();
        store
            .create_dataset(
                "zroot/warden/ptn/old/cntr/abc12345",
                &PathBuf::from("/warden/ptn/old/cntr/abc12345"),
            )
            .unwrap();
        store
            .rename_dataset(
                "zroot/warden/ptn/old",
                "zroot/warden/ptn/new",
                &PathBuf::from("/warden/ptn/new"),
            )
            .unwrap();
        assert!(!store.dataset_exists("zroot/warden/ptn/old").unwrap());
        assert!(store
            .dataset_exists("zroot/warden/ptn/new/cntr/abc12345")
            .unwrap());
        assert_eq!(
            store.mountpoint_of("zroot/warden/ptn/new/cntr/abc12345"),
            Some(PathBuf::from("/warden/ptn/new/cntr/abc12345"))
        );
    }

    #[test]
    fn rename_onto_an_existing_dataset_is_a_conflict() {
        let store = MemoryStore::new();
        store
            .create_dataset("zroot/a", &PathBuf::from("/a"))
            .unwrap();
        store
            .create_dataset("zroot/b", &PathBuf::from("/b"))
            .unwrap();
        let err = store
            .rename_dataset("zroot/a", "zroot/b", &PathBuf::from("/b"))
            .unwrap_err();
        assert!(matches!(err, WardenError::StateConflict(_)));
    }

    #[test]
    fn list_children_is_single_level() {
        let store = store_with("zroot/warden/ptn/default/cntr/abc12345");
        store
            .create_dataset("zroot/warden/ptn/default/cntr/zzz99999", &PathBuf::from("/mnt2"))
            .unwrap();
        let mut children = store.list_children("zroot/warden/ptn/default/cntr").unwrap();
        children.sort();
        assert_eq!(
            children,
            vec![
                "zroot/warden/ptn/default/cntr/abc12345".to_string(),
                "zroot/warden/ptn/default/cntr/zzz99999".to_string(),
            ]
        );
        assert!(store.list_children("zroot/warden/ptn/default").unwrap().len() == 1);
    }
}
