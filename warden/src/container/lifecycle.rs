//! The lifecycle orchestrator: create, start, stop, destroy.
//!
//! The property store is the single authority for what teardown must
//! undo. Create and start keep an explicit undo stack; the first hard
//! failure unwinds everything already provisioned in that sequence.
//! Stop and destroy are best-effort per step so a degraded host can
//! still reclaim resources.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::config::{HostConfig, CONTAINER_LOG_DIR};
use crate::dns::DnsRegistrar;
use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};
use crate::firewall::{
    ipfw::TableMembers, ContainerFirewall, HostFirewall, RuleInputs, TABLE_CONTAINER_WHITELIST,
    TABLE_GROUP_PEERS, TABLE_PARTITION_WHITELIST,
};
use crate::host::{generate_uuid, Host};
use crate::jail::{JailController, Liveness};
use crate::limits::ResourceLimiter;
use crate::net::{alloc, AllocationLock, NetworkProvisioner};
use crate::partition::PartitionManager;
use crate::proxy::{Layer4Forward, ProxyRegistrar, UrlMapping};
use crate::release::ReleaseFilesystem;
use crate::store::{array_prop, array_values, keys, prop, PropertyStore};

use super::actions::{ActionContext, ActionRunner};
use super::bootstrap::{
    self, IPFW_RULES_JAIL_PATH, ONSTOP_SCRIPT_JAIL_PATH,
};
use super::{Action, Container, ContainerSpec, ContainerState, PortList};

/// Reversal steps recorded while create/start make progress. Unwound
/// in reverse order on the first hard failure.
enum Undo {
    DestroyDataset(String),
    RemoveDir(PathBuf),
    RemoveJail(String),
    DestroyIface(String),
    DeregisterPublic { ip: String, host_iface: String },
    ReleaseLimits(String),
    RetractDns(String),
    RetractProxy(String),
    ClearProvisioning(String),
}

struct Rollback {
    steps: Vec<Undo>,
    armed: bool,
}

impl Rollback {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            armed: true,
        }
    }

    fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// Forget the recorded steps; the sequence completed.
    fn disarm(&mut self) {
        self.armed = false;
        self.steps.clear();
    }

    fn unwind(&mut self, mgr: &LifecycleManager) {
        if !self.armed {
            return;
        }
        for step in self.steps.drain(..).rev() {
            match step {
                Undo::DestroyDataset(dataset) => {
                    if let Err(err) = mgr.store.destroy_dataset(&dataset) {
                        error!(dataset, %err, "rollback: could not destroy dataset");
                    }
                }
                Undo::RemoveDir(path) => {
                    if let Err(err) = std::fs::remove_dir_all(&path) {
                        error!(path = %path.display(), %err, "rollback: could not remove dir");
                    }
                }
                Undo::RemoveJail(uuid) => {
                    if let Err(err) = mgr.jail.remove(&uuid) {
                        error!(uuid, %err, "rollback: could not remove jail");
                    }
                }
                Undo::DestroyIface(iface) => {
                    if let Err(err) = mgr.net.detach(&iface) {
                        error!(iface, %err, "rollback: could not destroy interface");
                    }
                }
                Undo::DeregisterPublic { ip, host_iface } => {
                    mgr.host_firewall.deregister_public(&ip, &host_iface);
                }
                Undo::ReleaseLimits(uuid) => {
                    if let Err(err) = mgr.limits.release(&uuid) {
                        error!(uuid, %err, "rollback: could not release limits");
                    }
                }
                Undo::RetractDns(uuid) => {
                    if let Err(err) = mgr.dns.retract_owner(&uuid) {
                        error!(uuid, %err, "rollback: could not retract dns");
                    }
                }
                Undo::RetractProxy(uuid) => {
                    if let Err(err) = mgr.proxy.retract_owner(&uuid) {
                        error!(uuid, %err, "rollback: could not retract proxy");
                    }
                }
                Undo::ClearProvisioning(dataset) => {
                    for key in [
                        keys::IP4_ADDR,
                        keys::IP6_ADDR,
                        keys::HOST_IFACE,
                        keys::CONTAINER_IFACE,
                    ] {
                        if let Err(err) = mgr.store.unset(&dataset, &prop(key)) {
                            error!(dataset, %err, "rollback: could not clear provisioning fact");
                        }
                    }
                }
            }
        }
    }
}

/// Optional start-time network overrides; anything unset resolves from
/// host-wide defaults.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub bridge: Option<String>,
    pub ip4: Option<Ipv4Addr>,
    pub cidr: Option<u8>,
    /// Override for the otherwise 6to4-derived address.
    pub ip6: Option<Ipv6Addr>,
}

pub struct LifecycleManager {
    config: HostConfig,
    store: Arc<dyn PropertyStore>,
    runner: Arc<dyn CommandRunner>,
    host: Host,
    partitions: PartitionManager,
    jail: JailController,
    net: NetworkProvisioner,
    firewall: ContainerFirewall,
    host_firewall: HostFirewall,
    limits: ResourceLimiter,
    release_fs: ReleaseFilesystem,
    dns: DnsRegistrar,
    proxy: ProxyRegistrar,
    actions: ActionRunner,
}

impl LifecycleManager {
    pub fn new(
        config: HostConfig,
        store: Arc<dyn PropertyStore>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            host: Host::new(config.clone(), store.clone()),
            partitions: PartitionManager::new(config.clone(), store.clone()),
            jail: JailController::new(runner.clone()),
            net: NetworkProvisioner::new(runner.clone()),
            firewall: ContainerFirewall::new(runner.clone(), &config.lock_dir),
            host_firewall: HostFirewall::new(runner.clone()),
            limits: ResourceLimiter::new(runner.clone()),
            release_fs: ReleaseFilesystem::new(config.clone(), runner.clone()),
            dns: DnsRegistrar::new(&config.dns_config_dir, runner.clone()),
            proxy: ProxyRegistrar::new(
                &config.proxy_config_dir,
                &config.layer4_forwards_file,
                runner.clone(),
            ),
            actions: ActionRunner::new(config.clone(), runner.clone()),
            config,
            store,
            runner,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Current state as derivable from the store and the namespace
    /// liveness probe.
    pub fn state(&self, partition: &str, uuid: &str) -> WardenResult<ContainerState> {
        if !self.host.container_exists(partition, uuid)? {
            return Ok(ContainerState::Unprovisioned);
        }
        let dataset = self.config.container_dataset(partition, uuid);
        match self.jail.liveness(uuid) {
            Liveness::Running => Ok(ContainerState::Running),
            Liveness::Unknown => Err(WardenError::StateConflict(format!(
                "liveness of {} cannot be determined",
                uuid
            ))),
            Liveness::NotRunning => {
                // ever started before?
                if self.store.get(&dataset, &prop(keys::HOST_IFACE))?.is_some()
                    || self.store.get(&dataset, &prop(keys::END_EPOCH))?.is_some()
                {
                    Ok(ContainerState::Stopped)
                } else {
                    Ok(ContainerState::Created)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // create

    pub fn create(&self, spec: &ContainerSpec) -> WardenResult<String> {
        spec.validate()?;
        if !self.partitions.exists(&spec.partition)? {
            return Err(WardenError::NotFound(format!(
                "partition {}",
                spec.partition
            )));
        }
        if self.host.uuid_for_name(&spec.partition, &spec.name)?.is_some() {
            return Err(WardenError::StateConflict(format!(
                "container {} already exists in partition {}",
                spec.name, spec.partition
            )));
        }
        let release = spec
            .release
            .clone()
            .unwrap_or_else(|| self.config.default_release.clone());
        if !self.release_fs.exists(&release) {
            return Err(WardenError::NotFound(format!("release {}", release)));
        }

        let mut rng = StdRng::from_os_rng();
        let existing = self.host.all_container_uuids()?;
        let uuid = generate_uuid(&existing, self.config.alloc_max_retries, &mut rng)?;

        let mut rollback = Rollback::new();
        let result = self.create_inner(spec, &uuid, &release, &mut rollback);
        if result.is_err() {
            rollback.unwind(self);
        }
        result.map(|_| uuid)
    }

    fn create_inner(
        &self,
        spec: &ContainerSpec,
        uuid: &str,
        release: &str,
        rollback: &mut Rollback,
    ) -> WardenResult<()> {
        let dataset = self.config.container_dataset(&spec.partition, uuid);
        let mount = self.config.container_mount(&spec.partition, uuid);

        info!(uuid, name = %spec.name, partition = %spec.partition, "creating container");
        self.store.create_dataset(&dataset, &mount)?;
        rollback.push(Undo::DestroyDataset(dataset.clone()));
        self.store.mount_dataset(&dataset)?;

        let root = mount.join("root");
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(mount.join(CONTAINER_LOG_DIR))?;
        rollback.push(Undo::RemoveDir(mount.clone()));

        self.release_fs.populate(release, &root)?;
        self.release_fs.create_mountpoints(&root)?;

        let fqdn = format!("{}.{}", spec.name, self.config.domain_name(&spec.partition));
        bootstrap::write_file(&root.join("etc/rc.conf"), &bootstrap::render_rc_conf(&fqdn))?;
        bootstrap::write_file(
            &root.join("etc/resolv.conf"),
            &bootstrap::render_resolv_conf(
                &self.config.domain_name(&spec.partition),
                &self.config.dns_servers,
            ),
        )?;
        bootstrap::write_script(
            &root.join(IPFW_RULES_JAIL_PATH.trim_start_matches('/')),
            &bootstrap::render_firewall_bootstrap(),
        )?;
        let fstab_lines = self.release_fs.fstab_lines(release, &root);
        bootstrap::write_file(&mount.join("fstab"), &format!("{}\n", fstab_lines.join("\n")))?;

        self.persist_spec(spec, uuid, release, &dataset)?;
        rollback.disarm();
        info!(uuid, "container created");
        Ok(())
    }

    fn persist_spec(
        &self,
        spec: &ContainerSpec,
        uuid: &str,
        release: &str,
        dataset: &str,
    ) -> WardenResult<()> {
        let set = |key: &str, value: &str| self.store.set(dataset, &prop(key), value);
        set(keys::UUID, uuid)?;
        set(keys::NAME, &spec.name)?;
        set(keys::PARTITION, &spec.partition)?;
        set(keys::RELEASE, release)?;
        set(keys::DOMAIN, &self.config.domain_name(&spec.partition))?;
        set(keys::BUILD_EPOCH, &Utc::now().timestamp().to_string())?;
        if let Some(group) = &spec.group {
            set(keys::GROUP, group)?;
        }
        set(keys::MAX_CPU, &spec.max_cpu_limit().as_stored())?;
        set(keys::MAX_RAM, &spec.max_ram_limit().as_stored())?;
        set(keys::MAX_HDD, &spec.max_hdd_limit().as_stored())?;

        let arrays: [(&str, Vec<String>); 5] = [
            (keys::TCP_IN_PORTS, spec.tcp_in_ports.entries()),
            (keys::UDP_IN_PORTS, spec.udp_in_ports.entries()),
            (keys::TCP_OUT_PORTS, spec.tcp_out_ports.entries()),
            (keys::UDP_OUT_PORTS, spec.udp_out_ports.entries()),
            (keys::CONTAINER_WHITELIST, spec.ipv4_whitelist.clone()),
        ];
        for (key, values) in arrays {
            for value in values {
                self.store.append_array(dataset, &array_prop(key), &value)?;
            }
        }
        for mapping in &spec.url_mappings {
            let raw = serde_json::to_string(mapping)
                .map_err(|e| WardenError::Internal(e.to_string()))?;
            self.store.append_array(dataset, &array_prop(keys::URL), &raw)?;
        }
        for forward in &spec.layer4_forwards {
            let raw = serde_json::to_string(forward)
                .map_err(|e| WardenError::Internal(e.to_string()))?;
            self.store
                .append_array(dataset, &array_prop(keys::LAYER4), &raw)?;
        }
        for action in &spec.on_create {
            let raw = serde_json::to_string(action)
                .map_err(|e| WardenError::Internal(e.to_string()))?;
            self.store
                .append_array(dataset, &array_prop(keys::ON_CREATE), &raw)?;
        }
        for action in &spec.on_stop {
            let raw = serde_json::to_string(action)
                .map_err(|e| WardenError::Internal(e.to_string()))?;
            self.store
                .append_array(dataset, &array_prop(keys::ON_STOP), &raw)?;
        }
        // namespace parameters are persisted fully resolved, so a later
        // change to the host defaults never alters an existing container
        let params = self.config.jail_defaults.resolve(&spec.options);
        for (option, value) in params.as_options() {
            self.store.append_array(
                dataset,
                &array_prop(keys::OPTIONS),
                &format!("{}={}", option, value),
            )?;
        }
        if let Some(dir) = &spec.source_dir {
            set(keys::SOURCE_DIR, dir)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // start

    pub fn start(&self, partition: &str, uuid: &str, opts: &StartOptions) -> WardenResult<()> {
        match self.jail.liveness(uuid) {
            Liveness::NotRunning => {}
            Liveness::Running => {
                return Err(WardenError::StateConflict(format!(
                    "container {} is already running",
                    uuid
                )))
            }
            Liveness::Unknown => {
                return Err(WardenError::StateConflict(format!(
                    "liveness of {} cannot be determined, refusing to start",
                    uuid
                )))
            }
        }
        if !self.host.container_exists(partition, uuid)? {
            return Err(WardenError::NotFound(format!(
                "container {} in partition {}",
                uuid, partition
            )));
        }
        let mut rollback = Rollback::new();
        let result = self.start_inner(partition, uuid, opts, &mut rollback);
        if result.is_err() {
            rollback.unwind(self);
        }
        result
    }

    fn start_inner(
        &self,
        partition: &str,
        uuid: &str,
        opts: &StartOptions,
        rollback: &mut Rollback,
    ) -> WardenResult<()> {
        let dataset = self.config.container_dataset(partition, uuid);
        let mount = self.config.container_mount(partition, uuid);
        let root = mount.join("root");

        let name = self
            .store
            .get(&dataset, &prop(keys::NAME))?
            .ok_or_else(|| WardenError::NotFound(format!("container {} has no name", uuid)))?;
        let domain = self.config.domain_name(partition);
        let fqdn = format!("{}.{}", name, domain);
        info!(uuid, %fqdn, "starting container");

        // namespace parameters come back fully resolved from the store;
        // every key was persisted at create
        let overrides: BTreeMap<String, String> = self
            .stored_array(&dataset, keys::OPTIONS)?
            .into_iter()
            .filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();
        let params = self.config.jail_defaults.resolve(&overrides);

        let console_log = mount.join(CONTAINER_LOG_DIR).join("console");
        let fstab = mount.join("fstab");
        self.jail
            .create(uuid, &fqdn, &domain, &root, &console_log, &fstab, &params)?;
        rollback.push(Undo::RemoveJail(uuid.to_string()));

        // address allocation is host-wide; hold the lock from the
        // in-use query to the store writeback
        let bridge = opts
            .bridge
            .clone()
            .unwrap_or_else(|| self.config.private_bridge.clone());
        let is_public = bridge == self.config.public_bridge;
        let cidr = opts.cidr.unwrap_or(self.config.private_cidr);
        let attachment = {
            let _lock = AllocationLock::acquire(&self.config.lock_dir)?;
            let ip4 = match opts.ip4 {
                Some(ip) => {
                    if self.host.ips_in_use()?.contains(&ip) {
                        return Err(WardenError::StateConflict(format!(
                            "address {} is already in use",
                            ip
                        )));
                    }
                    ip
                }
                None => {
                    let mut rng = StdRng::from_os_rng();
                    alloc::allocate_ip4(
                        self.config.private_network,
                        cidr,
                        &self.host.ips_in_use()?,
                        self.config.alloc_max_retries,
                        &mut rng,
                    )?
                }
            };
            let gateway = if is_public {
                self.config.public_default_route
            } else {
                self.config.private_default_route
            };
            let attachment = self
                .net
                .attach(uuid, &bridge, ip4, cidr, opts.ip6, Some(gateway))?;
            rollback.push(Undo::DestroyIface(attachment.host_iface.clone()));

            // provisioning facts are what stop/destroy will read back
            rollback.push(Undo::ClearProvisioning(dataset.clone()));
            self.store
                .set(&dataset, &prop(keys::IP4_ADDR), &attachment.ip4_record())?;
            self.store
                .set(&dataset, &prop(keys::IP6_ADDR), &attachment.ip6_record())?;
            self.store
                .set(&dataset, &prop(keys::HOST_IFACE), &attachment.host_iface)?;
            self.store.set(
                &dataset,
                &prop(keys::CONTAINER_IFACE),
                &attachment.container_iface,
            )?;
            attachment
        };

        if is_public {
            // publicly bridged containers still reach the private
            // network through the host's public gateway
            self.net.add_net_route(
                uuid,
                self.config.private_network,
                self.config.private_cidr,
                self.config.public_default_route,
            )?;
            self.host_firewall
                .register_public(&attachment.ip4.to_string(), &attachment.host_iface)?;
            rollback.push(Undo::DeregisterPublic {
                ip: attachment.ip4.to_string(),
                host_iface: attachment.host_iface.clone(),
            });
        }

        let container = Container::load(&self.store, &dataset)?;

        let max_cpu = self.stored_limit(&dataset, keys::MAX_CPU)?;
        let max_ram = self.stored_limit(&dataset, keys::MAX_RAM)?;
        let max_hdd = self.stored_limit(&dataset, keys::MAX_HDD)?;
        self.limits
            .apply(uuid, &self.store, &dataset, &max_cpu, &max_ram, &max_hdd)?;
        rollback.push(Undo::ReleaseLimits(uuid.to_string()));

        self.apply_firewall(&container, &dataset, &root)?;

        // running peers learn the new address through table membership
        // alone; their rule text stays as generated
        if let Some(group) = &container.group {
            self.propagate_group_membership(partition, group, uuid, &attachment.ip4, true)?;
        }

        let on_create = self.stored_actions(&dataset, keys::ON_CREATE)?;
        if !on_create.is_empty() {
            let source_dir = self
                .store
                .get(&dataset, &prop(keys::SOURCE_DIR))?
                .map(PathBuf::from);
            let data_dir = self.partitions.data_dir(partition);
            let ctx = ActionContext {
                uuid,
                primary_ip: attachment.ip4,
                container_root: &root,
                partition_data_dir: &data_dir,
                source_dir: source_dir.as_deref(),
                jail: &self.jail,
            };
            self.actions.run_all(&ctx, &on_create)?;
        }

        let on_stop = self.stored_actions(&dataset, keys::ON_STOP)?;
        if !on_stop.is_empty() {
            let script = bootstrap::render_onstop_script(&on_stop)?;
            bootstrap::write_script(
                &root.join(ONSTOP_SCRIPT_JAIL_PATH.trim_start_matches('/')),
                &script,
            )?;
            self.store
                .set(&dataset, &prop(keys::ONSTOP_SCRIPT), ONSTOP_SCRIPT_JAIL_PATH)?;
        }

        self.dns
            .register(&fqdn, &attachment.ip4.to_string(), uuid)?;
        rollback.push(Undo::RetractDns(uuid.to_string()));
        self.store
            .append_array(&dataset, &array_prop(keys::REGISTERED_DNS_NAMES), &fqdn)?;

        self.register_proxy(&dataset, partition, uuid, attachment.ip4)?;
        rollback.push(Undo::RetractProxy(uuid.to_string()));
        self.dns.reload();
        self.proxy.reload();

        self.store.unset(&dataset, &prop(keys::END_EPOCH))?;
        rollback.disarm();
        info!(uuid, ip = %attachment.ip4, "container started");
        Ok(())
    }

    fn apply_firewall(
        &self,
        container: &Container,
        dataset: &str,
        root: &std::path::Path,
    ) -> WardenResult<()> {
        let iface = container.primary_interface()?;
        let whitelist = self.stored_array(dataset, keys::CONTAINER_WHITELIST)?;
        let partition_whitelist = self.host.partition_whitelist(&container.partition)?;
        let group_ips = match &container.group {
            Some(group) => self
                .host
                .group_member_ips(&container.partition, group, &container.uuid)?,
            None => Vec::new(),
        };

        let urls = self.stored_urls(dataset)?;
        let inputs = RuleInputs {
            ip4: IpAddr::V4(iface.ip4),
            tcp_in: self.stored_ports(dataset, keys::TCP_IN_PORTS)?.to_port_spec(),
            udp_in: self.stored_ports(dataset, keys::UDP_IN_PORTS)?.to_port_spec(),
            tcp_out: self.stored_ports(dataset, keys::TCP_OUT_PORTS)?.to_port_spec(),
            udp_out: self.stored_ports(dataset, keys::UDP_OUT_PORTS)?.to_port_spec(),
            has_group: container.group.is_some(),
            has_whitelist: !whitelist.is_empty() || !partition_whitelist.is_empty(),
            proxy_ip: IpAddr::V4(self.config.proxy_ip),
            url_without_cert: urls.iter().any(|u| u.cert.is_none()),
            url_with_cert: urls.iter().any(|u| u.cert.is_some()),
        };
        let rules = crate::firewall::synthesize(&inputs);

        let mut tables = TableMembers::new();
        tables.insert(
            TABLE_GROUP_PEERS,
            group_ips.iter().map(Ipv4Addr::to_string).collect(),
        );
        tables.insert(TABLE_PARTITION_WHITELIST, partition_whitelist);
        tables.insert(TABLE_CONTAINER_WHITELIST, whitelist);

        let host_path = root.join(IPFW_RULES_JAIL_PATH.trim_start_matches('/'));
        self.firewall.apply(
            &container.uuid,
            &host_path,
            IPFW_RULES_JAIL_PATH,
            &rules,
            &tables,
        )
    }

    /// Add or remove this container's address in the table-1 membership
    /// of every running peer of its group. Best-effort per peer.
    fn propagate_group_membership(
        &self,
        partition: &str,
        group: &str,
        uuid: &str,
        ip: &Ipv4Addr,
        add: bool,
    ) -> WardenResult<()> {
        for peer in self.host.group_members(partition, group, uuid)? {
            if !matches!(self.jail.liveness(&peer.uuid), Liveness::Running) {
                continue;
            }
            let member = ip.to_string();
            let result = if add {
                self.firewall.table_add(&peer.uuid, TABLE_GROUP_PEERS, &member)
            } else {
                self.firewall
                    .table_remove(&peer.uuid, TABLE_GROUP_PEERS, &member)
            };
            if let Err(err) = result {
                warn!(uuid, peer = %peer.uuid, %err, "group table update on peer failed");
            }
        }
        Ok(())
    }

    fn register_proxy(
        &self,
        dataset: &str,
        partition: &str,
        uuid: &str,
        ip: Ipv4Addr,
    ) -> WardenResult<()> {
        let urls = self.stored_urls(dataset)?;
        // whitelisted sources gate the proxied locations as well
        let mut access = self.stored_array(dataset, keys::CONTAINER_WHITELIST)?;
        access.extend(self.host.partition_whitelist(partition)?);
        for mapping in &urls {
            let (upstream, server) = self.proxy.register_url(uuid, mapping, ip, &access)?;
            self.store.append_array(
                dataset,
                &array_prop(keys::PROXY_UPSTREAM_FILES),
                &upstream.display().to_string(),
            )?;
            self.store.append_array(
                dataset,
                &array_prop(keys::PROXY_SERVERNAME_FILES),
                &server.display().to_string(),
            )?;
            for redirect in &mapping.redirects {
                self.proxy.register_redirect(
                    uuid,
                    redirect,
                    mapping.hostname(),
                    mapping.cert.as_deref(),
                )?;
                self.store
                    .append_array(dataset, &array_prop(keys::REDIRECT_URL), redirect)?;
            }
            // registered hostnames resolve to the proxy, which owns
            // termination; only the container fqdn points at it directly
            let hostname = mapping.hostname().to_string();
            if hostname.contains('.') {
                self.dns
                    .register(&hostname, &self.config.proxy_ip.to_string(), uuid)?;
                self.store.append_array(
                    dataset,
                    &array_prop(keys::REGISTERED_DNS_NAMES),
                    &hostname,
                )?;
            }
        }
        for forward in self.stored_layer4(dataset)? {
            self.proxy.register_layer4(uuid, ip, &forward)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // stop

    /// Tear down the running state. Every step is attempted; failures
    /// are reported individually and collected into the result.
    pub fn stop(&self, partition: &str, uuid: &str) -> WardenResult<()> {
        if !self.host.container_exists(partition, uuid)? {
            return Err(WardenError::NotFound(format!(
                "container {} in partition {}",
                uuid, partition
            )));
        }
        let dataset = self.config.container_dataset(partition, uuid);
        let running = matches!(self.jail.liveness(uuid), Liveness::Running);
        let mut failures: Vec<String> = Vec::new();
        info!(uuid, running, "stopping container");

        if running {
            if let Some(script) = self.store.get(&dataset, &prop(keys::ONSTOP_SCRIPT))? {
                if let Err(err) = self.jail.exec(uuid, &["/bin/sh", &script]) {
                    warn!(uuid, %err, "on-stop script failed");
                    failures.push(format!("on-stop script: {}", err));
                }
            }
            if let Err(err) = self.jail.remove(uuid) {
                warn!(uuid, %err, "jail removal failed");
                failures.push(format!("jail removal: {}", err));
            }
        }

        if let Err(err) = self.proxy.retract_owner(uuid) {
            failures.push(format!("proxy retraction: {}", err));
        }
        if let Err(err) = self.dns.retract_owner(uuid) {
            failures.push(format!("dns retraction: {}", err));
        }
        self.proxy.reload();
        self.dns.reload();

        let ip_record = self.store.get(&dataset, &prop(keys::IP4_ADDR))?;
        let host_iface = self.store.get(&dataset, &prop(keys::HOST_IFACE))?;
        if let (Some(record), Some(iface)) = (&ip_record, &host_iface) {
            if let Some((bridge, ip, _)) = crate::net::parse_ip4_record(record) {
                if bridge == self.config.public_bridge {
                    self.host_firewall.deregister_public(&ip.to_string(), iface);
                }
            }
        }
        if let Some(record) = &ip_record {
            if let (Some((_, ip, _)), Some(group)) = (
                crate::net::parse_ip4_record(record),
                self.store.get(&dataset, &prop(keys::GROUP))?,
            ) {
                if let Err(err) =
                    self.propagate_group_membership(partition, &group, uuid, &ip, false)
                {
                    failures.push(format!("group table retraction: {}", err));
                }
            }
        }
        if let Err(err) = self.limits.release(uuid) {
            warn!(uuid, %err, "limit release failed");
            failures.push(format!("limit release: {}", err));
        }
        if let Some(iface) = &host_iface {
            if let Err(err) = self.net.detach(iface) {
                warn!(uuid, iface, %err, "host interface destroy failed");
                failures.push(format!("interface destroy: {}", err));
            }
        }

        let root = self.config.container_mount(partition, uuid).join("root");
        if let Err(err) = self.release_fs.unmount_base_dirs(&root) {
            failures.push(format!("base unmount: {}", err));
        }

        // the spec stays; only provisioning facts are cleared
        self.store.unset(&dataset, &prop(keys::HOST_IFACE))?;
        self.store.unset(&dataset, &prop(keys::CONTAINER_IFACE))?;
        self.store
            .unset_array(&dataset, &array_prop(keys::REGISTERED_DNS_NAMES))?;
        self.store
            .unset_array(&dataset, &array_prop(keys::PROXY_UPSTREAM_FILES))?;
        self.store
            .unset_array(&dataset, &array_prop(keys::PROXY_SERVERNAME_FILES))?;
        self.store
            .set(&dataset, &prop(keys::END_EPOCH), &Utc::now().timestamp().to_string())?;

        if failures.is_empty() {
            info!(uuid, "container stopped");
            Ok(())
        } else {
            Err(WardenError::Internal(format!(
                "container {} stopped with {} failed steps: {}",
                uuid,
                failures.len(),
                failures.join("; ")
            )))
        }
    }

    // ------------------------------------------------------------------
    // destroy

    /// Irreversibly remove a stopped container. Refused while the
    /// namespace is live or its liveness cannot be determined; nothing
    /// is mutated in that case.
    pub fn destroy(&self, partition: &str, uuid: &str) -> WardenResult<()> {
        if !self.host.container_exists(partition, uuid)? {
            return Err(WardenError::NotFound(format!(
                "container {} in partition {}",
                uuid, partition
            )));
        }
        match self.jail.liveness(uuid) {
            Liveness::NotRunning => {}
            Liveness::Running => {
                return Err(WardenError::StateConflict(format!(
                    "container {} is running, stop it first",
                    uuid
                )))
            }
            Liveness::Unknown => {
                return Err(WardenError::StateConflict(format!(
                    "liveness of {} cannot be determined, refusing to destroy",
                    uuid
                )))
            }
        }
        let dataset = self.config.container_dataset(partition, uuid);
        let mount = self.config.container_mount(partition, uuid);
        info!(uuid, "destroying container");

        self.unmount_all_under(&mount)?;

        if let Err(err) = self.dns.retract_owner(uuid) {
            warn!(uuid, %err, "dns retraction failed during destroy");
        }
        if let Err(err) = self.proxy.retract_owner(uuid) {
            warn!(uuid, %err, "proxy retraction failed during destroy");
        }
        self.dns.reload();
        self.proxy.reload();

        // the dataset must go before the container can be forgotten;
        // on failure the container stays observable
        self.store.destroy_dataset(&dataset)?;
        if mount.exists() {
            std::fs::remove_dir_all(&mount)?;
        }
        info!(uuid, "container destroyed");
        Ok(())
    }

    /// Unmount everything mounted below `mount`, leaving devfs for
    /// last.
    fn unmount_all_under(&self, mount: &std::path::Path) -> WardenResult<()> {
        let out = self.runner.run_checked(&Cmd::new("mount").arg("-p"))?;
        let prefix = mount.display().to_string();
        let mut devfs: Vec<String> = Vec::new();
        let mut others: Vec<String> = Vec::new();
        for line in out.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(_src), Some(target), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if !target.starts_with(&prefix) {
                continue;
            }
            if fstype == "devfs" {
                devfs.push(target.to_string());
            } else {
                others.push(target.to_string());
            }
        }
        // deepest first, devfs last
        others.sort_by_key(|t| std::cmp::Reverse(t.len()));
        for mountpoint in others.into_iter().chain(devfs) {
            let cmd = Cmd::new("umount").args(["-f", &mountpoint]);
            if let Err(err) = self.runner.run_checked(&cmd) {
                warn!(mountpoint, %err, "unmount failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // store readback helpers

    fn stored_array(&self, dataset: &str, key: &str) -> WardenResult<Vec<String>> {
        Ok(array_values(
            self.store.get_array(dataset, &array_prop(key))?,
        ))
    }

    fn stored_ports(&self, dataset: &str, key: &str) -> WardenResult<PortList> {
        PortList::from_entries(&self.stored_array(dataset, key)?)
    }

    fn stored_limit(&self, dataset: &str, key: &str) -> WardenResult<crate::limits::Limit> {
        Ok(self
            .store
            .get(dataset, &prop(key))?
            .as_deref()
            .map(crate::limits::Limit::parse)
            .unwrap_or(crate::limits::Limit::Unlimited))
    }

    fn stored_urls(&self, dataset: &str) -> WardenResult<Vec<UrlMapping>> {
        self.stored_array(dataset, keys::URL)?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| WardenError::Internal(format!("corrupt url mapping: {}", e)))
            })
            .collect()
    }

    fn stored_layer4(&self, dataset: &str) -> WardenResult<Vec<Layer4Forward>> {
        self.stored_array(dataset, keys::LAYER4)?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| WardenError::Internal(format!("corrupt layer-4 forward: {}", e)))
            })
            .collect()
    }

    fn stored_actions(&self, dataset: &str, key: &str) -> WardenResult<Vec<Action>> {
        self.stored_array(dataset, key)?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw)
                    .map_err(|e| WardenError::Internal(format!("corrupt action: {}", e)))
            })
            .collect()
    }
}
