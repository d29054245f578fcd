//! Pure rule synthesis for a single container address. The output
//! order is the precedence order the packet filter evaluates in.

use std::net::IpAddr;

use super::{
    Direction, Endpoint, PortSpec, Proto, Rule, TABLE_CONTAINER_WHITELIST, TABLE_GROUP_PEERS,
    TABLE_PARTITION_WHITELIST,
};

/// Everything rule generation depends on, gathered up front so the
/// synthesis itself stays a pure function.
#[derive(Debug, Clone)]
pub struct RuleInputs {
    pub ip4: IpAddr,
    pub tcp_in: PortSpec,
    pub udp_in: PortSpec,
    pub tcp_out: PortSpec,
    pub udp_out: PortSpec,
    /// container belongs to a group (table 1 is populated)
    pub has_group: bool,
    /// partition or container whitelist is non-empty (tables 2/3)
    pub has_whitelist: bool,
    pub proxy_ip: IpAddr,
    /// at least one registered URL without a certificate
    pub url_without_cert: bool,
    /// at least one registered URL with a certificate
    pub url_with_cert: bool,
}

pub fn synthesize(inputs: &RuleInputs) -> Vec<Rule> {
    let me = Endpoint::Addr(inputs.ip4);
    let mut out = Vec::new();

    // 1. declared in-ports from the three membership tables
    for table in [
        TABLE_GROUP_PEERS,
        TABLE_PARTITION_WHITELIST,
        TABLE_CONTAINER_WHITELIST,
    ] {
        push_in_ports(&mut out, inputs, Endpoint::Table(table), me.clone());
    }

    // 2. no group and no whitelist: plain default, open to any source
    if !inputs.has_group && !inputs.has_whitelist {
        push_in_ports(&mut out, inputs, Endpoint::Any, me.clone());
    }

    // 3. implicit egress for http/https and dns unless the matching
    //    out list already allows everything, then the declared egress
    if !inputs.tcp_out.is_any() {
        out.push(Rule::outbound(
            Proto::Tcp,
            me.clone(),
            Endpoint::Any,
            PortSpec::Ports(vec![80, 443]),
        ));
    }
    if !inputs.udp_out.is_any() {
        out.push(Rule::outbound(
            Proto::Udp,
            me.clone(),
            Endpoint::Any,
            PortSpec::Ports(vec![53]),
        ));
    }
    push_out_ports(&mut out, &inputs.tcp_out, Proto::Tcp, me.clone());
    push_out_ports(&mut out, &inputs.udp_out, Proto::Udp, me.clone());

    // 4. proxy reachability per registered URL certificate state
    if inputs.url_without_cert {
        out.push(Rule::inbound(
            Proto::Tcp,
            Endpoint::Addr(inputs.proxy_ip),
            me.clone(),
            PortSpec::Ports(vec![80]),
        ));
    }
    if inputs.url_with_cert {
        out.push(Rule::inbound(
            Proto::Tcp,
            Endpoint::Addr(inputs.proxy_ip),
            me.clone(),
            PortSpec::Ports(vec![443]),
        ));
    }

    // 5. self and loopback, any protocol
    out.push(Rule {
        direction: Direction::Out,
        proto: Proto::Ip,
        src: me.clone(),
        dst: me.clone(),
        ports: PortSpec::Any,
    });
    out.push(Rule {
        direction: Direction::Out,
        proto: Proto::Ip,
        src: Endpoint::Loopback,
        dst: Endpoint::Loopback,
        ports: PortSpec::Any,
    });

    out
}

fn push_in_ports(out: &mut Vec<Rule>, inputs: &RuleInputs, src: Endpoint, me: Endpoint) {
    match &inputs.tcp_in {
        PortSpec::Any => out.push(Rule::inbound(
            Proto::Tcp,
            src.clone(),
            me.clone(),
            PortSpec::Any,
        )),
        PortSpec::Ports(ports) if !ports.is_empty() => out.push(Rule::inbound(
            Proto::Tcp,
            src.clone(),
            me.clone(),
            PortSpec::Ports(ports.clone()),
        )),
        _ => {}
    }
    match &inputs.udp_in {
        PortSpec::Any => out.push(Rule::inbound(Proto::Udp, src, me, PortSpec::Any)),
        PortSpec::Ports(ports) if !ports.is_empty() => {
            out.push(Rule::inbound(Proto::Udp, src, me, PortSpec::Ports(ports.clone())))
        }
        _ => {}
    }
}

fn push_out_ports(out: &mut Vec<Rule>, spec: &PortSpec, proto: Proto, me: Endpoint) {
    match spec {
        PortSpec::Any => out.push(Rule::outbound(proto, me, Endpoint::Any, PortSpec::Any)),
        PortSpec::Ports(ports) if !ports.is_empty() => out.push(Rule::outbound(
            proto,
            me,
            Endpoint::Any,
            PortSpec::Ports(ports.clone()),
        )),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn base_inputs() -> RuleInputs {
        RuleInputs {
            ip4: IpAddr::V4(Ipv4Addr::new(10, 99, 1, 2)),
            tcp_in: PortSpec::Ports(vec![80, 443]),
            udp_in: PortSpec::Ports(vec![]),
            tcp_out: PortSpec::Ports(vec![]),
            udp_out: PortSpec::Ports(vec![]),
            has_group: false,
            has_whitelist: false,
            proxy_ip: IpAddr::V4(Ipv4Addr::new(10, 99, 255, 254)),
            url_without_cert: false,
            url_with_cert: false,
        }
    }

    fn has_rule(rules: &[Rule], f: impl Fn(&Rule) -> bool) -> bool {
        rules.iter().any(f)
    }

    #[test]
    fn ungrouped_container_is_open_to_any() {
        let rules = synthesize(&base_inputs());
        assert!(has_rule(&rules, |r| {
            r.direction == Direction::In
                && r.src == Endpoint::Any
                && r.ports == PortSpec::Ports(vec![80, 443])
        }));
    }

    #[test]
    fn grouped_container_has_no_open_default() {
        let mut inputs = base_inputs();
        inputs.has_group = true;
        let rules = synthesize(&inputs);
        assert!(!has_rule(&rules, |r| r.direction == Direction::In
            && r.src == Endpoint::Any));
        assert!(has_rule(&rules, |r| r.src
            == Endpoint::Table(TABLE_GROUP_PEERS)));
    }

    #[test]
    fn table_stanzas_come_before_default() {
        let rules = synthesize(&base_inputs());
        let first_table = rules
            .iter()
            .position(|r| matches!(r.src, Endpoint::Table(_)))
            .unwrap();
        let default = rules
            .iter()
            .position(|r| r.direction == Direction::In && r.src == Endpoint::Any)
            .unwrap();
        assert!(first_table < default);
    }

    #[test]
    fn implicit_egress_unless_any() {
        let rules = synthesize(&base_inputs());
        assert!(has_rule(&rules, |r| r.direction == Direction::Out
            && r.proto == Proto::Tcp
            && r.ports == PortSpec::Ports(vec![80, 443])));
        assert!(has_rule(&rules, |r| r.direction == Direction::Out
            && r.proto == Proto::Udp
            && r.ports == PortSpec::Ports(vec![53])));

        let mut inputs = base_inputs();
        inputs.tcp_out = PortSpec::Any;
        inputs.udp_out = PortSpec::Any;
        let rules = synthesize(&inputs);
        assert!(!has_rule(&rules, |r| r.direction == Direction::Out
            && r.proto == Proto::Tcp
            && r.ports == PortSpec::Ports(vec![80, 443])));
        assert!(has_rule(&rules, |r| r.direction == Direction::Out
            && r.proto == Proto::Tcp
            && r.ports == PortSpec::Any));
    }

    #[test]
    fn proxy_rules_follow_certificates() {
        let mut inputs = base_inputs();
        inputs.url_without_cert = true;
        let rules = synthesize(&inputs);
        let proxy = Endpoint::Addr(inputs.proxy_ip);
        assert!(has_rule(&rules, |r| r.src == proxy
            && r.ports == PortSpec::Ports(vec![80])));
        assert!(!has_rule(&rules, |r| r.src == proxy
            && r.ports == PortSpec::Ports(vec![443])));

        inputs.url_with_cert = true;
        let rules = synthesize(&inputs);
        assert!(has_rule(&rules, |r| r.src == proxy
            && r.ports == PortSpec::Ports(vec![443])));
    }

    #[test]
    fn self_and_loopback_always_present() {
        let rules = synthesize(&base_inputs());
        let me = Endpoint::Addr(base_inputs().ip4);
        assert!(has_rule(&rules, |r| r.src == me
            && r.dst == me
            && r.proto == Proto::Ip));
        assert!(has_rule(&rules, |r| r.src == Endpoint::Loopback));
    }
}
