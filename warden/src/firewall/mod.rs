//! Firewall rule model and application.
//!
//! Rule text and table membership are deliberately separate: whitelist
//! edits only touch table membership, the generated rule text never
//! changes for them.

use std::net::IpAddr;

pub mod ipfw;
pub mod rules;

pub use ipfw::{ContainerFirewall, HostFirewall};
pub use rules::{synthesize, RuleInputs};

/// Table aliases as used by generated rules.
pub const TABLE_GROUP_PEERS: u8 = 1;
pub const TABLE_PARTITION_WHITELIST: u8 = 2;
pub const TABLE_CONTAINER_WHITELIST: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
    /// any protocol
    Ip,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
            Proto::Ip => "ip",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Any,
    Addr(IpAddr),
    Table(u8),
    /// 127.0.0.1/8 and ::1
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Any,
    Ports(Vec<u16>),
}

impl PortSpec {
    pub fn is_any(&self) -> bool {
        matches!(self, PortSpec::Any)
    }
}

/// One allow rule. The generated set is allow-only with a drop tail
/// appended by the renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub direction: Direction,
    pub proto: Proto,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub ports: PortSpec,
}

impl Rule {
    pub fn inbound(proto: Proto, src: Endpoint, dst: Endpoint, ports: PortSpec) -> Self {
        Self {
            direction: Direction::In,
            proto,
            src,
            dst,
            ports,
        }
    }

    pub fn outbound(proto: Proto, src: Endpoint, dst: Endpoint, ports: PortSpec) -> Self {
        Self {
            direction: Direction::Out,
            proto,
            src,
            dst,
            ports,
        }
    }
}
