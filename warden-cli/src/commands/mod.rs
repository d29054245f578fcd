pub mod create;
pub mod destroy;
pub mod list;
pub mod partition;
pub mod start;
pub mod stop;

use anyhow::{bail, Result};
use warden::LifecycleManager;

/// Accept either a uuid or a container name and resolve it to a uuid
/// within the partition.
pub fn resolve_container(
    mgr: &LifecycleManager,
    partition: &str,
    name_or_uuid: &str,
) -> Result<String> {
    if mgr.host().container_exists(partition, name_or_uuid)? {
        return Ok(name_or_uuid.to_string());
    }
    if let Some(uuid) = mgr.host().uuid_for_name(partition, name_or_uuid)? {
        return Ok(uuid);
    }
    bail!(
        "no container {:?} in partition {:?}",
        name_or_uuid,
        partition
    );
}
