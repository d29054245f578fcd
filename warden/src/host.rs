//! Host-wide queries and identity allocation. Everything here reads
//! the property store; nothing mutates container state.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use rand::Rng;

use crate::config::HostConfig;
use crate::errors::{WardenError, WardenResult};
use crate::net::parse_ip4_record;
use crate::store::{array_prop, keys, prop, PropertyStore};

const UUID_LEN: usize = 8;
const UUID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Draw a fresh 8-character alphanumeric identifier that does not
/// collide with `existing`. Collisions are retried a bounded number of
/// times so a corrupted store cannot wedge the caller.
pub fn generate_uuid<R: Rng>(
    existing: &HashSet<String>,
    max_retries: usize,
    rng: &mut R,
) -> WardenResult<String> {
    for _ in 0..max_retries {
        let candidate: String = (0..UUID_LEN)
            .map(|_| UUID_ALPHABET[rng.random_range(0..UUID_ALPHABET.len())] as char)
            .collect();
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(WardenError::StateConflict(format!(
        "could not find a free container id after {} attempts",
        max_retries
    )))
}

/// Another member of a container group, as recorded in the store.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub uuid: String,
    pub ip4: Ipv4Addr,
}

pub struct Host {
    config: HostConfig,
    store: Arc<dyn PropertyStore>,
}

impl Host {
    pub fn new(config: HostConfig, store: Arc<dyn PropertyStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    pub fn partitions(&self) -> WardenResult<Vec<String>> {
        let children = self.store.list_children(&self.config.partitions_dataset)?;
        Ok(children
            .into_iter()
            .filter_map(|ds| ds.rsplit('/').next().map(str::to_string))
            .collect())
    }

    /// Container datasets under one partition.
    pub fn container_datasets(&self, partition: &str) -> WardenResult<Vec<String>> {
        let parent = self.config.container_parent_dataset(partition);
        if !self.store.dataset_exists(&parent)? {
            return Ok(Vec::new());
        }
        self.store.list_children(&parent)
    }

    pub fn all_container_datasets(&self) -> WardenResult<Vec<String>> {
        let mut out = Vec::new();
        for partition in self.partitions()? {
            out.extend(self.container_datasets(&partition)?);
        }
        Ok(out)
    }

    pub fn all_container_uuids(&self) -> WardenResult<HashSet<String>> {
        Ok(self
            .all_container_datasets()?
            .into_iter()
            .filter_map(|ds| ds.rsplit('/').next().map(str::to_string))
            .collect())
    }

    pub fn container_exists(&self, partition: &str, uuid: &str) -> WardenResult<bool> {
        self.store
            .dataset_exists(&self.config.container_dataset(partition, uuid))
    }

    /// Resolve a user-facing container name inside a partition.
    pub fn uuid_for_name(&self, partition: &str, name: &str) -> WardenResult<Option<String>> {
        for dataset in self.container_datasets(partition)? {
            if self.store.get(&dataset, &prop(keys::NAME))?.as_deref() == Some(name) {
                return Ok(self
                    .store
                    .get(&dataset, &prop(keys::UUID))?
                    .or_else(|| dataset.rsplit('/').next().map(str::to_string)));
            }
        }
        Ok(None)
    }

    /// Partition a uuid belongs to, scanning all partitions.
    pub fn partition_of(&self, uuid: &str) -> WardenResult<Option<String>> {
        for partition in self.partitions()? {
            if self.container_exists(&partition, uuid)? {
                return Ok(Some(partition));
            }
        }
        Ok(None)
    }

    /// Every IPv4 address currently recorded on any container.
    pub fn ips_in_use(&self) -> WardenResult<HashSet<Ipv4Addr>> {
        let mut out = HashSet::new();
        for dataset in self.all_container_datasets()? {
            if let Some(record) = self.store.get(&dataset, &prop(keys::IP4_ADDR))? {
                if let Some((_, ip, _)) = parse_ip4_record(&record) {
                    out.insert(ip);
                }
            }
        }
        // the gateway address is never handed out
        out.insert(self.config.private_default_route);
        Ok(out)
    }

    /// The other members of a container group that have a recorded
    /// address.
    pub fn group_members(
        &self,
        partition: &str,
        group: &str,
        exclude_uuid: &str,
    ) -> WardenResult<Vec<GroupMember>> {
        let mut out = Vec::new();
        for dataset in self.container_datasets(partition)? {
            if dataset.ends_with(&format!("/{}", exclude_uuid)) {
                continue;
            }
            if self.store.get(&dataset, &prop(keys::GROUP))?.as_deref() != Some(group) {
                continue;
            }
            let uuid = match dataset.rsplit('/').next() {
                Some(uuid) => uuid.to_string(),
                None => continue,
            };
            if let Some(record) = self.store.get(&dataset, &prop(keys::IP4_ADDR))? {
                if let Some((_, ip4, _)) = parse_ip4_record(&record) {
                    out.push(GroupMember { uuid, ip4 });
                }
            }
        }
        Ok(out)
    }

    /// IPv4 addresses of the other members of a container group.
    pub fn group_member_ips(
        &self,
        partition: &str,
        group: &str,
        exclude_uuid: &str,
    ) -> WardenResult<Vec<Ipv4Addr>> {
        Ok(self
            .group_members(partition, group, exclude_uuid)?
            .into_iter()
            .map(|member| member.ip4)
            .collect())
    }

    /// Partition ip4 whitelist entries.
    pub fn partition_whitelist(&self, partition: &str) -> WardenResult<Vec<String>> {
        let dataset = self.config.partition_dataset(partition);
        Ok(self
            .store
            .get_array(&dataset, &array_prop(keys::PARTITION_WHITELIST))?
            .into_iter()
            .map(|(_, value)| value)
            .collect())
    }
}
