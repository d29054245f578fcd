//! Persistent hierarchical property store.
//!
//! The store is the only durable state authority: everything a stop or
//! destroy needs to undo is written here during create/start, and a
//! container reloaded from the store must reproduce identical teardown
//! behavior.
//!
//! Ordered arrays are emulated on top of scalar properties with
//! `name:index` keys. Appends scan for the maximum index and write
//! `index + 1`; each implementation serializes appends per array key
//! (see [`ArrayLocks`]) so the scan-then-write sequence cannot race
//! within a process. The contract is single writer per host; the
//! host-wide file locks used for firewall apply and address allocation
//! cover the cross-process cases that matter.

mod memory;
mod zfs;

pub use memory::MemoryStore;
pub use zfs::ZfsStore;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::errors::WardenResult;

/// Root of the warden property namespace on every dataset.
pub const PROP_ROOT: &str = "com.warden";

/// Scalar property name under the warden namespace.
pub fn prop(name: &str) -> String {
    format!("{}:{}", PROP_ROOT, name)
}

/// Array property name under the warden namespace. Arrays use `.` so a
/// scalar `com.warden:url` and an array `com.warden.url:0` can never
/// collide.
pub fn array_prop(name: &str) -> String {
    format!("{}.{}", PROP_ROOT, name)
}

/// Well-known property names (combined with [`prop`] / [`array_prop`]).
pub mod keys {
    pub const UUID: &str = "host_hostuuid";
    pub const NAME: &str = "containername";
    pub const GROUP: &str = "containergroupname";
    pub const PARTITION: &str = "partition";
    pub const RELEASE: &str = "releasename";
    pub const DOMAIN: &str = "domainname";
    pub const BUILD_EPOCH: &str = "buildepoch";
    pub const END_EPOCH: &str = "endepoch";
    pub const MAX_CPU: &str = "maxcpu";
    pub const MAX_RAM: &str = "maxram";
    pub const MAX_HDD: &str = "maxhdd";
    pub const IP4_ADDR: &str = "ip4_addr";
    pub const IP6_ADDR: &str = "ip6_addr";
    pub const HOST_IFACE: &str = "host_iface";
    pub const CONTAINER_IFACE: &str = "container_iface";
    pub const ONSTOP_SCRIPT: &str = "onstopscript";
    pub const SOURCE_DIR: &str = "sourcedir";

    // Arrays.
    pub const REGISTERED_DNS_NAMES: &str = "registered_dns_names";
    pub const TCP_IN_PORTS: &str = "tcpinports";
    pub const TCP_OUT_PORTS: &str = "tcpoutports";
    pub const UDP_IN_PORTS: &str = "udpinports";
    pub const UDP_OUT_PORTS: &str = "udpoutports";
    pub const URL: &str = "url";
    pub const REDIRECT_URL: &str = "redirect_url";
    pub const PROXY_UPSTREAM_FILES: &str = "proxy_upstream";
    pub const PROXY_SERVERNAME_FILES: &str = "proxy_servername";
    pub const LAYER4: &str = "layer4proxy";
    pub const ON_CREATE: &str = "oncreate";
    pub const ON_STOP: &str = "onstop";
    pub const OPTIONS: &str = "options";
    pub const CONTAINER_WHITELIST: &str = "ip4whitelist";
    pub const PARTITION_WHITELIST: &str = "ptn_ip4whitelist";
}

/// Scalar and ordered-array properties keyed by hierarchical dataset
/// path. Any underlying query failure is a `StoreUnavailable` error,
/// never an empty result indistinguishable from "key absent".
pub trait PropertyStore: Send + Sync {
    fn get(&self, dataset: &str, key: &str) -> WardenResult<Option<String>>;
    fn set(&self, dataset: &str, key: &str, value: &str) -> WardenResult<()>;
    fn unset(&self, dataset: &str, key: &str) -> WardenResult<()>;

    /// Values of `key` across the dataset and all descendants.
    fn get_recursive(&self, dataset: &str, key: &str) -> WardenResult<Vec<String>>;

    /// Append to an ordered array; insertion order is preserved.
    fn append_array(&self, dataset: &str, array: &str, value: &str) -> WardenResult<()>;

    /// Array entries sorted by index.
    fn get_array(&self, dataset: &str, array: &str) -> WardenResult<Vec<(usize, String)>>;

    /// Remove every indexed entry of the array.
    fn unset_array(&self, dataset: &str, array: &str) -> WardenResult<()>;

    // Dataset-level operations.
    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool>;
    fn create_dataset(&self, dataset: &str, mountpoint: &Path) -> WardenResult<()>;
    /// Recursively destroys the dataset and its children.
    fn destroy_dataset(&self, dataset: &str) -> WardenResult<()>;
    /// Rename the dataset (children move with it) and point it at the
    /// new mountpoint, which inherits down the subtree.
    fn rename_dataset(&self, from: &str, to: &str, mountpoint: &Path) -> WardenResult<()>;
    fn mount_dataset(&self, dataset: &str) -> WardenResult<()>;
    fn unmount_dataset(&self, dataset: &str, force: bool) -> WardenResult<()>;
    /// Direct children of the dataset, as full dataset paths.
    fn list_children(&self, dataset: &str) -> WardenResult<Vec<String>>;
}

/// Per-key append serialization shared by store implementations.
#[derive(Default)]
pub(crate) struct ArrayLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArrayLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Lock guarding appends to `dataset`/`array`.
    pub(crate) fn for_key(&self, dataset: &str, array: &str) -> Arc<Mutex<()>> {
        let key = format!("{}\u{0}{}", dataset, array);
        self.locks.lock().entry(key).or_default().clone()
    }
}

/// Convenience: just the values of an array result, in index order.
pub fn array_values(entries: Vec<(usize, String)>) -> Vec<String> {
    entries.into_iter().map(|(_, v)| v).collect()
}
