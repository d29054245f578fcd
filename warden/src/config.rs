//! Host-wide configuration.
//!
//! One immutable [`HostConfig`] value is built at startup and passed
//! explicitly into every component constructor. Nothing in the crate
//! reads ambient global state.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{WardenError, WardenResult};
use crate::jail::JailParams;

/// Directory name for container datasets under a partition.
pub const CONTAINER_DIR_NAME: &str = "cntr";
/// Directory name for the partition-level data area.
pub const PARTITION_DATA_DIR_NAME: &str = "data";
/// Log directory inside a container's mountpoint (next to `root/`).
pub const CONTAINER_LOG_DIR: &str = "log";

/// Immutable host-wide configuration shared by all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    // Storage layout.
    #[serde(default = "default_partitions_dataset")]
    pub partitions_dataset: String,
    #[serde(default = "default_partitions_mount")]
    pub partitions_mount: PathBuf,
    #[serde(default = "default_releases_mount")]
    pub releases_mount: PathBuf,
    #[serde(default = "default_release")]
    pub default_release: String,

    // Networking.
    #[serde(default = "default_private_bridge")]
    pub private_bridge: String,
    #[serde(default = "default_public_bridge")]
    pub public_bridge: String,
    #[serde(default = "default_private_network")]
    pub private_network: Ipv4Addr,
    #[serde(default = "default_private_cidr")]
    pub private_cidr: u8,
    #[serde(default = "default_private_route")]
    pub private_default_route: Ipv4Addr,
    /// Upstream gateway used by containers on the public bridge.
    #[serde(default = "default_public_route")]
    pub public_default_route: Ipv4Addr,
    /// Address of the host reverse proxy; the only source allowed to
    /// reach registered URL backends on 80/443.
    #[serde(default = "default_proxy_ip")]
    pub proxy_ip: Ipv4Addr,
    #[serde(default = "default_tld")]
    pub tld: String,
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,

    // Collaborator locations.
    #[serde(default = "default_dns_config_dir")]
    pub dns_config_dir: PathBuf,
    #[serde(default = "default_proxy_config_dir")]
    pub proxy_config_dir: PathBuf,
    #[serde(default = "default_layer4_file")]
    pub layer4_forwards_file: PathBuf,
    #[serde(default = "default_pkg_cache_dir")]
    pub pkg_cache_dir: PathBuf,
    /// Directory for host-wide lock files (firewall apply, allocation).
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Bound on random picks during IPv4 allocation before reporting
    /// pool exhaustion.
    #[serde(default = "default_alloc_retries")]
    pub alloc_max_retries: usize,

    /// Host-wide defaults for the jail technical/security options; used
    /// for any option a container spec leaves unset.
    #[serde(default)]
    pub jail_defaults: JailParams,
}

fn default_partitions_dataset() -> String {
    "zroot/warden/ptn".into()
}
fn default_partitions_mount() -> PathBuf {
    "/warden/ptn".into()
}
fn default_releases_mount() -> PathBuf {
    "/warden/releases".into()
}
fn default_release() -> String {
    "11.0-RELEASE".into()
}
fn default_private_bridge() -> String {
    "bridge1".into()
}
fn default_public_bridge() -> String {
    "bridge0".into()
}
fn default_private_network() -> Ipv4Addr {
    Ipv4Addr::new(10, 99, 0, 0)
}
fn default_private_cidr() -> u8 {
    16
}
fn default_private_route() -> Ipv4Addr {
    Ipv4Addr::new(10, 99, 255, 254)
}
fn default_public_route() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 0, 1)
}
fn default_proxy_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 99, 255, 254)
}
fn default_tld() -> String {
    "warden".into()
}
fn default_dns_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(10, 99, 255, 254)]
}
fn default_dns_config_dir() -> PathBuf {
    "/usr/local/etc/unbound/configs".into()
}
fn default_proxy_config_dir() -> PathBuf {
    "/usr/local/etc/nginx".into()
}
fn default_layer4_file() -> PathBuf {
    "/usr/local/etc/ipfw.layer4".into()
}
fn default_pkg_cache_dir() -> PathBuf {
    "/var/cache/pkg".into()
}
fn default_lock_dir() -> PathBuf {
    "/var/run/warden".into()
}
fn default_alloc_retries() -> usize {
    1024
}

impl Default for HostConfig {
    fn default() -> Self {
        // Round-trips through serde so every field picks up its
        // `default = ...` function.
        serde_json::from_str("{}").expect("default HostConfig is valid")
    }
}

impl HostConfig {
    /// Load configuration from a JSON file, filling unset fields with
    /// defaults.
    pub fn load(path: &Path) -> WardenResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| WardenError::Validation(format!("invalid host config {}: {}", path.display(), e)))
    }

    pub fn partition_dataset(&self, partition: &str) -> String {
        format!("{}/{}", self.partitions_dataset, partition)
    }

    pub fn partition_mount(&self, partition: &str) -> PathBuf {
        self.partitions_mount.join(partition)
    }

    pub fn container_parent_dataset(&self, partition: &str) -> String {
        format!(
            "{}/{}/{}",
            self.partitions_dataset, partition, CONTAINER_DIR_NAME
        )
    }

    pub fn container_dataset(&self, partition: &str, uuid: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.partitions_dataset, partition, CONTAINER_DIR_NAME, uuid
        )
    }

    pub fn container_mount(&self, partition: &str, uuid: &str) -> PathBuf {
        self.partitions_mount
            .join(partition)
            .join(CONTAINER_DIR_NAME)
            .join(uuid)
    }

    pub fn release_root(&self, release: &str) -> PathBuf {
        self.releases_mount.join(release).join("root")
    }

    /// Domain part of a container FQDN: `<partition>.<tld>`.
    pub fn domain_name(&self, partition: &str) -> String {
        format!("{}.{}", partition, self.tld)
    }
}
