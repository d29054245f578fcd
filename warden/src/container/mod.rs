//! Container model: the declarative specification, the persisted
//! runtime object and its state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{WardenError, WardenResult};
use crate::firewall::PortSpec;
use crate::limits::Limit;
use crate::net::parse_ip4_record;
use crate::proxy::{Layer4Forward, UrlMapping};
use crate::store::{array_prop, keys, prop, PropertyStore};

pub mod actions;
pub mod bootstrap;
pub mod lifecycle;

pub use lifecycle::{LifecycleManager, StartOptions};

/// Declared port list: concrete ports or the "any" sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortList {
    #[default]
    None,
    Any,
    Ports(Vec<u16>),
}

impl PortList {
    pub fn to_port_spec(&self) -> PortSpec {
        match self {
            PortList::None => PortSpec::Ports(Vec::new()),
            PortList::Any => PortSpec::Any,
            PortList::Ports(ports) => PortSpec::Ports(ports.clone()),
        }
    }

    /// Store representation: one entry per port, or the literal `any`.
    pub fn entries(&self) -> Vec<String> {
        match self {
            PortList::None => Vec::new(),
            PortList::Any => vec!["any".to_string()],
            PortList::Ports(ports) => ports.iter().map(u16::to_string).collect(),
        }
    }

    pub fn from_entries(entries: &[String]) -> WardenResult<PortList> {
        if entries.is_empty() {
            return Ok(PortList::None);
        }
        if entries.iter().any(|e| e.eq_ignore_ascii_case("any")) {
            return Ok(PortList::Any);
        }
        let ports = entries
            .iter()
            .map(|e| {
                e.parse::<u16>()
                    .map_err(|_| WardenError::Validation(format!("invalid port {:?}", e)))
            })
            .collect::<WardenResult<Vec<u16>>>()?;
        Ok(PortList::Ports(ports))
    }
}

impl Serialize for PortList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PortList {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Entry {
            Num(u16),
            Text(String),
        }
        let raw = Vec::<Entry>::deserialize(deserializer)?;
        let entries: Vec<String> = raw
            .into_iter()
            .map(|e| match e {
                Entry::Num(n) => n.to_string(),
                Entry::Text(t) => t,
            })
            .collect();
        PortList::from_entries(&entries).map_err(serde::de::Error::custom)
    }
}

/// Declarative container actions, run in declared order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Action {
    Exec {
        value: String,
    },
    InstallPackage {
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    FileFolderMapping {
        source: String,
        target: String,
    },
    PersistentStorage {
        value: String,
    },
    #[serde(other)]
    Unknown,
}

/// The user-facing container specification. Everything here is
/// declarative; provisioning facts live on the dataset, not in the
/// spec.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSpec {
    pub name: String,
    pub partition: String,
    pub release: Option<String>,
    pub group: Option<String>,
    pub tcp_in_ports: PortList,
    pub udp_in_ports: PortList,
    pub tcp_out_ports: PortList,
    pub udp_out_ports: PortList,
    pub ipv4_whitelist: Vec<String>,
    pub url_mappings: Vec<UrlMapping>,
    pub layer4_forwards: Vec<Layer4Forward>,
    pub max_cpu: Option<String>,
    pub max_ram: Option<String>,
    pub max_hdd: Option<String>,
    /// jail(8) option overrides by option name
    pub options: BTreeMap<String, String>,
    pub on_create: Vec<Action>,
    pub on_stop: Vec<Action>,
    /// source directory for fileFolderMapping actions
    pub source_dir: Option<String>,
}

impl ContainerSpec {
    pub fn validate(&self) -> WardenResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(WardenError::Validation(format!(
                "invalid container name {:?}",
                self.name
            )));
        }
        if self.partition.is_empty() {
            return Err(WardenError::Validation("partition is required".into()));
        }
        for entry in &self.ipv4_whitelist {
            validate_addr_or_cidr(entry)?;
        }
        for mapping in &self.url_mappings {
            if mapping.url.is_empty() {
                return Err(WardenError::Validation("empty url mapping".into()));
            }
        }
        for size in [&self.max_ram, &self.max_hdd].into_iter().flatten() {
            validate_size(size)?;
        }
        if let Some(cpu) = &self.max_cpu {
            validate_cpu(cpu)?;
        }
        Ok(())
    }

    pub fn max_cpu_limit(&self) -> Limit {
        self.max_cpu.as_deref().map(Limit::parse).unwrap_or(Limit::Unlimited)
    }

    pub fn max_ram_limit(&self) -> Limit {
        self.max_ram.as_deref().map(Limit::parse).unwrap_or(Limit::Unlimited)
    }

    pub fn max_hdd_limit(&self) -> Limit {
        self.max_hdd.as_deref().map(Limit::parse).unwrap_or(Limit::Unlimited)
    }
}

fn validate_addr_or_cidr(entry: &str) -> WardenResult<()> {
    let (addr, cidr) = match entry.split_once('/') {
        Some((addr, cidr)) => (addr, Some(cidr)),
        None => (entry, None),
    };
    if addr.parse::<std::net::Ipv4Addr>().is_err() {
        return Err(WardenError::Validation(format!(
            "invalid whitelist address {:?}",
            entry
        )));
    }
    if let Some(cidr) = cidr {
        match cidr.parse::<u8>() {
            Ok(n) if n <= 32 => {}
            _ => {
                return Err(WardenError::Validation(format!(
                    "invalid whitelist cidr {:?}",
                    entry
                )))
            }
        }
    }
    Ok(())
}

fn validate_size(size: &str) -> WardenResult<()> {
    if size.eq_ignore_ascii_case("unlimited") {
        return Ok(());
    }
    let digits = size.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let suffix = &size[digits.len()..];
    if digits.is_empty() || digits.parse::<u64>().is_err() {
        return Err(WardenError::Validation(format!("invalid size {:?}", size)));
    }
    match suffix {
        "" | "K" | "M" | "G" | "T" | "k" | "m" | "g" | "t" => Ok(()),
        _ => Err(WardenError::Validation(format!("invalid size {:?}", size))),
    }
}

fn validate_cpu(cpu: &str) -> WardenResult<()> {
    if cpu.eq_ignore_ascii_case("unlimited") {
        return Ok(());
    }
    let digits = cpu.trim_end_matches('%');
    if digits.parse::<u32>().is_err() {
        return Err(WardenError::Validation(format!("invalid cpu limit {:?}", cpu)));
    }
    Ok(())
}

/// A provisioned interface as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub bridge: String,
    pub host_iface: String,
    pub container_iface: String,
    pub ip4: std::net::Ipv4Addr,
    pub cidr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Unprovisioned,
    Created,
    Stopped,
    Running,
    Destroyed,
}

impl ContainerState {
    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Unprovisioned, Created)
                | (Created, Running)
                | (Created, Destroyed)
                | (Stopped, Running)
                | (Stopped, Destroyed)
                | (Running, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Unprovisioned => "unprovisioned",
            ContainerState::Created => "created",
            ContainerState::Stopped => "stopped",
            ContainerState::Running => "running",
            ContainerState::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container as known to the host: its identity and whatever
/// provisioning facts the store holds. The store copy is authoritative;
/// this object is a snapshot.
#[derive(Debug, Clone)]
pub struct Container {
    pub uuid: String,
    pub name: String,
    pub partition: String,
    pub group: Option<String>,
    pub release: String,
    pub interfaces: Vec<NetInterface>,
    pub build_epoch: Option<i64>,
}

impl Container {
    /// Primary interface used for proxy/DNS/firewall registration.
    /// Explicit so a missing interface fails clearly instead of
    /// panicking on an index.
    pub fn primary_interface(&self) -> WardenResult<&NetInterface> {
        self.interfaces.first().ok_or_else(|| {
            WardenError::StateConflict(format!(
                "container {} has no provisioned interface",
                self.uuid
            ))
        })
    }

    /// Rehydrate a container from its dataset. Teardown driven from a
    /// loaded object must behave identically to teardown driven from
    /// the object that provisioned it.
    pub fn load(store: &Arc<dyn PropertyStore>, dataset: &str) -> WardenResult<Container> {
        let uuid = store
            .get(dataset, &prop(keys::UUID))?
            .or_else(|| dataset.rsplit('/').next().map(str::to_string))
            .ok_or_else(|| WardenError::NotFound(format!("container at {}", dataset)))?;
        let name = store
            .get(dataset, &prop(keys::NAME))?
            .ok_or_else(|| WardenError::NotFound(format!("container {} has no name", uuid)))?;
        let partition = store
            .get(dataset, &prop(keys::PARTITION))?
            .ok_or_else(|| WardenError::NotFound(format!("container {} has no partition", uuid)))?;
        let group = store.get(dataset, &prop(keys::GROUP))?;
        let release = store.get(dataset, &prop(keys::RELEASE))?.unwrap_or_default();
        let build_epoch = store
            .get(dataset, &prop(keys::BUILD_EPOCH))?
            .and_then(|v| v.parse().ok());

        let mut interfaces = Vec::new();
        if let Some(record) = store.get(dataset, &prop(keys::IP4_ADDR))? {
            if let Some((bridge, ip4, cidr)) = parse_ip4_record(&record) {
                interfaces.push(NetInterface {
                    bridge,
                    host_iface: store
                        .get(dataset, &prop(keys::HOST_IFACE))?
                        .unwrap_or_default(),
                    container_iface: store
                        .get(dataset, &prop(keys::CONTAINER_IFACE))?
                        .unwrap_or_default(),
                    ip4,
                    cidr,
                });
            }
        }

        Ok(Container {
            uuid,
            name,
            partition,
            group,
            release,
            interfaces,
            build_epoch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    #[test]
    fn valid_transitions() {
        use ContainerState::*;
        assert!(Unprovisioned.can_transition_to(Created));
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Destroyed));
        assert!(Created.can_transition_to(Destroyed));
    }

    #[test]
    fn invalid_transitions() {
        use ContainerState::*;
        assert!(!Running.can_transition_to(Destroyed));
        assert!(!Running.can_transition_to(Created));
        assert!(!Destroyed.can_transition_to(Running));
        assert!(!Unprovisioned.can_transition_to(Running));
    }

    #[test]
    fn port_list_parses_any_sentinel() {
        let list: PortList = serde_json::from_str(r#"["any"]"#).unwrap();
        assert_eq!(list, PortList::Any);
        let list: PortList = serde_json::from_str(r#"[80, 443]"#).unwrap();
        assert_eq!(list, PortList::Ports(vec![80, 443]));
        let list: PortList = serde_json::from_str(r#"["80", "443"]"#).unwrap();
        assert_eq!(list, PortList::Ports(vec![80, 443]));
        let list: PortList = serde_json::from_str("[]").unwrap();
        assert_eq!(list, PortList::None);
    }

    #[test]
    fn port_list_rejects_garbage() {
        assert!(serde_json::from_str::<PortList>(r#"["http"]"#).is_err());
        assert!(serde_json::from_str::<PortList>(r#"[70000]"#).is_err());
    }

    #[test]
    fn actions_deserialize_by_type_tag() {
        let raw = r#"[
            {"type": "exec", "value": "touch /tmp/ready"},
            {"type": "installPackage", "value": "nginx"},
            {"type": "fileFolderMapping", "source": "partition/www", "target": "/usr/local/www"},
            {"type": "somethingNew"}
        ]"#;
        let actions: Vec<Action> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            actions[0],
            Action::Exec {
                value: "touch /tmp/ready".into()
            }
        );
        assert_eq!(
            actions[1],
            Action::InstallPackage {
                value: "nginx".into()
            }
        );
        assert_eq!(actions[3], Action::Unknown);
    }

    #[test]
    fn spec_validation_catches_bad_fields() {
        let mut spec = ContainerSpec {
            name: "web1".into(),
            partition: "default".into(),
            ..ContainerSpec::default()
        };
        spec.validate().unwrap();

        spec.ipv4_whitelist = vec!["not-an-ip".into()];
        assert!(matches!(
            spec.validate().unwrap_err(),
            WardenError::Validation(_)
        ));

        spec.ipv4_whitelist = vec!["203.0.113.0/24".into()];
        spec.max_ram = Some("lots".into());
        assert!(spec.validate().is_err());
        spec.max_ram = Some("512M".into());
        spec.max_cpu = Some("50%".into());
        spec.validate().unwrap();

        spec.name = "bad name".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn primary_interface_requires_provisioning() {
        let container = Container {
            uuid: "abc12345".into(),
            name: "web1".into(),
            partition: "default".into(),
            group: None,
            release: "11.0-RELEASE".into(),
            interfaces: Vec::new(),
            build_epoch: None,
        };
        assert!(matches!(
            container.primary_interface().unwrap_err(),
            WardenError::StateConflict(_)
        ));
    }

    #[test]
    fn load_round_trips_store_facts() {
        let store: Arc<dyn PropertyStore> = Arc::new(MemoryStore::new());
        let ds = "zroot/warden/ptn/default/cntr/abc12345";
        store.create_dataset(ds, &PathBuf::from("/mnt")).unwrap();
        store.set(ds, &prop(keys::UUID), "abc12345").unwrap();
        store.set(ds, &prop(keys::NAME), "web1").unwrap();
        store.set(ds, &prop(keys::PARTITION), "default").unwrap();
        store.set(ds, &prop(keys::RELEASE), "11.0-RELEASE").unwrap();
        store
            .set(ds, &prop(keys::IP4_ADDR), "bridge1|10.99.1.2/16")
            .unwrap();
        store.set(ds, &prop(keys::HOST_IFACE), "epair0a").unwrap();
        store.set(ds, &prop(keys::CONTAINER_IFACE), "vnet0").unwrap();

        let container = Container::load(&store, ds).unwrap();
        assert_eq!(container.name, "web1");
        let iface = container.primary_interface().unwrap();
        assert_eq!(iface.bridge, "bridge1");
        assert_eq!(iface.ip4, std::net::Ipv4Addr::new(10, 99, 1, 2));
        assert_eq!(iface.host_iface, "epair0a");
    }
}
