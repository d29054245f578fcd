//! Host-side container orchestration for FreeBSD jails.
//!
//! `warden` takes a declarative container specification through
//! create, start, stop and destroy on a single host: it materializes
//! the backing ZFS dataset, provisions vnet networking on a bridge,
//! synthesizes and applies per-container firewall rules, enforces
//! resource limits, and registers the container with the host DNS
//! resolver and reverse proxy.
//!
//! The [`store::PropertyStore`] is the single durable authority:
//! teardown is always driven by what the store records, never by
//! in-memory state.

pub mod config;
pub mod container;
pub mod dns;
pub mod errors;
pub mod exec;
pub mod firewall;
pub mod host;
pub mod jail;
pub mod limits;
pub mod net;
pub mod partition;
pub mod proxy;
pub mod release;
pub mod store;

pub use config::HostConfig;
pub use container::{Container, ContainerSpec, ContainerState, LifecycleManager};
pub use errors::{WardenError, WardenResult};
pub use exec::{CommandRunner, HostRunner};
pub use store::{MemoryStore, PropertyStore, ZfsStore};
