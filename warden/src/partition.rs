//! Partitions: the host-level grouping every container lives under.
//! A partition owns a dataset subtree, a persistent data directory and
//! an ip4 whitelist shared by its containers.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::{HostConfig, CONTAINER_DIR_NAME, PARTITION_DATA_DIR_NAME};
use crate::errors::{WardenError, WardenResult};
use crate::store::{array_prop, keys, prop, PropertyStore};

pub struct PartitionManager {
    config: HostConfig,
    store: Arc<dyn PropertyStore>,
}

impl PartitionManager {
    pub fn new(config: HostConfig, store: Arc<dyn PropertyStore>) -> Self {
        Self { config, store }
    }

    pub fn exists(&self, partition: &str) -> WardenResult<bool> {
        self.store
            .dataset_exists(&self.config.partition_dataset(partition))
    }

    /// Materialize a partition: its dataset, the container parent and
    /// the persistent data directory.
    pub fn create(&self, partition: &str) -> WardenResult<()> {
        validate_name(partition)?;
        if self.exists(partition)? {
            return Err(WardenError::StateConflict(format!(
                "partition {} already exists",
                partition
            )));
        }
        let dataset = self.config.partition_dataset(partition);
        let mount = self.config.partition_mount(partition);
        self.store.create_dataset(&dataset, &mount)?;
        self.store.mount_dataset(&dataset)?;

        let containers = format!("{}/{}", dataset, CONTAINER_DIR_NAME);
        self.store
            .create_dataset(&containers, &mount.join(CONTAINER_DIR_NAME))?;
        self.store.mount_dataset(&containers)?;

        std::fs::create_dir_all(mount.join(PARTITION_DATA_DIR_NAME))?;
        info!(partition, "created partition");
        Ok(())
    }

    /// Rename a partition. Its containers move with the dataset
    /// subtree and their partition/domain properties are rewritten.
    /// The caller ensures none of them is running; a live jail keeps
    /// paths under the old mountpoint.
    pub fn rename(&self, from: &str, to: &str) -> WardenResult<()> {
        validate_name(to)?;
        if !self.exists(from)? {
            return Err(WardenError::NotFound(format!("partition {}", from)));
        }
        if self.exists(to)? {
            return Err(WardenError::StateConflict(format!(
                "partition {} already exists",
                to
            )));
        }
        self.store.rename_dataset(
            &self.config.partition_dataset(from),
            &self.config.partition_dataset(to),
            &self.config.partition_mount(to),
        )?;

        let containers = self.config.container_parent_dataset(to);
        let domain = self.config.domain_name(to);
        for child in self.store.list_children(&containers)? {
            self.store.set(&child, &prop(keys::PARTITION), to)?;
            self.store.set(&child, &prop(keys::DOMAIN), &domain)?;
        }
        info!(from, to, "renamed partition");
        Ok(())
    }

    pub fn data_dir(&self, partition: &str) -> PathBuf {
        self.config
            .partition_mount(partition)
            .join(PARTITION_DATA_DIR_NAME)
    }

    pub fn whitelist(&self, partition: &str) -> WardenResult<Vec<String>> {
        let dataset = self.config.partition_dataset(partition);
        Ok(self
            .store
            .get_array(&dataset, &array_prop(keys::PARTITION_WHITELIST))?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }

    pub fn whitelist_add(&self, partition: &str, addr: &str) -> WardenResult<()> {
        if !self.exists(partition)? {
            return Err(WardenError::NotFound(format!("partition {}", partition)));
        }
        let dataset = self.config.partition_dataset(partition);
        self.store
            .append_array(&dataset, &array_prop(keys::PARTITION_WHITELIST), addr)
    }

    pub fn whitelist_clear(&self, partition: &str) -> WardenResult<()> {
        let dataset = self.config.partition_dataset(partition);
        self.store
            .unset_array(&dataset, &array_prop(keys::PARTITION_WHITELIST))
    }
}

fn validate_name(partition: &str) -> WardenResult<()> {
    if partition.is_empty()
        || !partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WardenError::Validation(format!(
            "invalid partition name {:?}",
            partition
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> PartitionManager {
        let mut config = HostConfig::default();
        let tmp = tempfile::tempdir().unwrap();
        config.partitions_mount = tmp.path().to_path_buf();
        // the tempdir must outlive the test body
        std::mem::forget(tmp);
        PartitionManager::new(config, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn create_then_exists() {
        let mgr = manager();
        assert!(!mgr.exists("default").unwrap());
        mgr.create("default").unwrap();
        assert!(mgr.exists("default").unwrap());
        assert!(mgr.data_dir("default").is_dir());
    }

    #[test]
    fn duplicate_create_is_a_conflict() {
        let mgr = manager();
        mgr.create("default").unwrap();
        let err = mgr.create("default").unwrap_err();
        assert!(matches!(err, WardenError::StateConflict(_)));
    }

    #[test]
    fn bad_names_rejected_before_any_mutation() {
        let mgr = manager();
        assert!(matches!(
            mgr.create("has space").unwrap_err(),
            WardenError::Validation(_)
        ));
        assert!(matches!(
            mgr.create("").unwrap_err(),
            WardenError::Validation(_)
        ));
    }

    #[test]
    fn rename_rewrites_container_partition_props() {
        let mgr = manager();
        mgr.create("staging").unwrap();
        let child = format!(
            "{}/{}",
            mgr.config.container_parent_dataset("staging"),
            "abc12345"
        );
        mgr.store
            .create_dataset(&child, &PathBuf::from("/mnt"))
            .unwrap();
        mgr.store
            .set(&child, &prop(keys::PARTITION), "staging")
            .unwrap();

        mgr.rename("staging", "prod").unwrap();
        assert!(!mgr.exists("staging").unwrap());
        assert!(mgr.exists("prod").unwrap());
        let moved = format!(
            "{}/{}",
            mgr.config.container_parent_dataset("prod"),
            "abc12345"
        );
        assert_eq!(
            mgr.store.get(&moved, &prop(keys::PARTITION)).unwrap().as_deref(),
            Some("prod")
        );
        assert_eq!(
            mgr.store.get(&moved, &prop(keys::DOMAIN)).unwrap().as_deref(),
            Some(&*mgr.config.domain_name("prod"))
        );
    }

    #[test]
    fn rename_onto_an_existing_partition_is_refused() {
        let mgr = manager();
        mgr.create("a").unwrap();
        mgr.create("b").unwrap();
        assert!(matches!(
            mgr.rename("a", "b").unwrap_err(),
            WardenError::StateConflict(_)
        ));
    }

    #[test]
    fn whitelist_round_trip() {
        let mgr = manager();
        mgr.create("default").unwrap();
        mgr.whitelist_add("default", "203.0.113.0/24").unwrap();
        mgr.whitelist_add("default", "198.51.100.7").unwrap();
        assert_eq!(
            mgr.whitelist("default").unwrap(),
            vec!["203.0.113.0/24".to_string(), "198.51.100.7".to_string()]
        );
        mgr.whitelist_clear("default").unwrap();
        assert!(mgr.whitelist("default").unwrap().is_empty());
    }
}
