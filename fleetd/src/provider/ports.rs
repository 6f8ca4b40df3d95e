//! Port-mapping subsystem (spec §4.E). Two backends — `device_proxy`
//! (native LXD/Incus proxy devices) and `iptables` — both preceded by a
//! range-compaction pass that collapses a single-port, 1:1, same-protocol
//! run into one device/rule set instead of N.

use crate::db::models::{MappingMethod, Port, Protocol};
use crate::error::TransportError;
use crate::transport::ssh::SshSession;

/// One device-proxy command or iptables rule set to apply, after range
/// compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingPlan {
    pub protocol: Protocol,
    pub host_start: u16,
    pub host_end: u16,
    pub guest_start: u16,
    pub is_ssh: bool,
}

impl PortMappingPlan {
    fn is_range(&self) -> bool {
        self.host_end > self.host_start
    }

    fn device_name(&self) -> String {
        let proto = protocol_tag(self.protocol);
        if self.is_range() {
            format!("{proto}-range-{}-{}", self.host_start, self.host_end)
        } else {
            format!("proxy-{proto}-{}", self.host_start)
        }
    }
}

fn protocol_tag(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Both => "tcp", // `both` is expanded into two plans before this point
    }
}

/// Collapses a set of active ports into the minimal set of device/rule
/// operations, with the SSH port ordered first so that reconnecting over
/// SSH is not blocked on the rest of the range landing (spec §4.E). `both`
/// protocol ports are expanded into one TCP and one UDP plan (spec §9 open
/// question 1: one `ports` row, two devices).
pub fn compact_plans(ports: &[Port]) -> Vec<PortMappingPlan> {
    let mut expanded: Vec<(Protocol, &Port)> = Vec::new();
    for port in ports {
        match port.protocol {
            Protocol::Both => {
                expanded.push((Protocol::Tcp, port));
                expanded.push((Protocol::Udp, port));
            }
            other => expanded.push((other, port)),
        }
    }

    let (ssh_ports, mut rest): (Vec<_>, Vec<_>) = expanded.into_iter().partition(|(_, p)| p.is_ssh);
    rest.sort_by_key(|(proto, p)| (proto_rank(*proto), p.host_port));

    let mut plans: Vec<PortMappingPlan> = ssh_ports
        .into_iter()
        .map(|(proto, p)| PortMappingPlan {
            protocol: proto,
            host_start: p.host_port,
            host_end: p.host_port,
            guest_start: p.guest_port,
            is_ssh: true,
        })
        .collect();

    let mut by_protocol: Vec<Vec<(Protocol, &Port)>> = Vec::new();
    for item in rest {
        match by_protocol.last_mut() {
            Some(group) if group.last().unwrap().0 == item.0 => group.push(item),
            _ => by_protocol.push(vec![item]),
        }
    }

    for group in by_protocol {
        plans.extend(compact_same_protocol(group));
    }

    plans
}

fn proto_rank(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Tcp => 0,
        Protocol::Udp => 1,
        Protocol::Both => 2,
    }
}

fn compact_same_protocol(mut group: Vec<(Protocol, &Port)>) -> Vec<PortMappingPlan> {
    group.sort_by_key(|(_, p)| p.host_port);
    let mut plans = Vec::new();
    let mut i = 0;
    while i < group.len() {
        let (protocol, start_port) = group[i];
        let mut j = i;
        while j + 1 < group.len() {
            let (_, cur) = group[j];
            let (_, next) = group[j + 1];
            let contiguous = next.host_port == cur.host_port + 1;
            let identity_mapped = cur.host_port == cur.guest_port && next.host_port == next.guest_port;
            if contiguous && identity_mapped {
                j += 1;
            } else {
                break;
            }
        }
        let (_, end_port) = group[j];
        plans.push(PortMappingPlan {
            protocol,
            host_start: start_port.host_port,
            host_end: end_port.host_port,
            guest_start: start_port.guest_port,
            is_ssh: false,
        });
        i = j + 1;
    }
    plans
}

/// Applies every plan via `device_proxy`, returning the shell commands
/// issued (for testing without a live SSH session) alongside running them.
pub async fn apply_device_proxy(
    session: &SshSession,
    cli: &str,
    instance_name: &str,
    host_ip: &str,
    guest_ip: &str,
    plans: &[PortMappingPlan],
) -> Result<Vec<String>, TransportError> {
    let mut issued = Vec::new();
    for plan in plans {
        let proto = protocol_tag(plan.protocol);
        let (host_range, guest_range) = if plan.is_range() {
            let span = plan.host_end - plan.host_start;
            (
                format!("{}-{}", plan.host_start, plan.host_end),
                format!("{}-{}", plan.guest_start, plan.guest_start + span),
            )
        } else {
            (plan.host_start.to_string(), plan.guest_start.to_string())
        };
        let device = plan.device_name();
        let cmd = format!(
            "{cli} config device add {instance_name} {device} proxy listen={proto}:{host_ip}:{host_range} connect={proto}:{guest_ip}:{guest_range}"
        );
        let result = session.exec(&cmd).await?;
        if !result.success() {
            return Err(TransportError::SshSession(format!(
                "failed to add proxy device {device}: {}",
                result.stderr
            )));
        }
        issued.push(cmd);
    }
    Ok(issued)
}

/// Three rules per mapping on the iptables backend: DNAT in `PREROUTING`,
/// an `ACCEPT` in `FORWARD`, and a `MASQUERADE` in `POSTROUTING`.
pub async fn apply_iptables(
    session: &SshSession,
    host_ip: &str,
    guest_ip: &str,
    plans: &[PortMappingPlan],
) -> Result<Vec<String>, TransportError> {
    let mut issued = Vec::new();
    for plan in plans {
        let proto = protocol_tag(plan.protocol);
        let dnat = format!(
            "iptables -t nat -A PREROUTING -p {proto} -d {host_ip} --dport {} -j DNAT --to-destination {guest_ip}:{}",
            plan.host_start, plan.guest_start
        );
        let forward = format!("iptables -A FORWARD -p {proto} -d {guest_ip} --dport {} -j ACCEPT", plan.guest_start);
        let masq = format!("iptables -t nat -A POSTROUTING -p {proto} -d {guest_ip} --dport {} -j MASQUERADE", plan.guest_start);
        for cmd in [dnat, forward, masq] {
            let result = session.exec(&cmd).await?;
            if !result.success() {
                return Err(TransportError::SshSession(format!(
                    "iptables rule failed: {cmd}: {}",
                    result.stderr
                )));
            }
            issued.push(cmd);
        }
    }
    Ok(issued)
}

pub fn backend_for(method: MappingMethod) -> &'static str {
    match method {
        MappingMethod::DeviceProxy => "device_proxy",
        MappingMethod::Iptables => "iptables",
        MappingMethod::Native => "native",
    }
}

/// Applies every active, non-native port on an instance through its own
/// backend, compacting each backend's group separately so the SSH-port-first
/// ordering (spec §4.E) holds within each (a `native` group is handled by
/// the adapter itself at create time via [`native_port_flags`], since it has
/// no device/rule to apply afterward).
pub async fn apply_port_mappings(
    session: &SshSession,
    cli: &str,
    instance_name: &str,
    host_ip: &str,
    guest_ip: &str,
    ports: &[Port],
) -> Result<(), TransportError> {
    for method in [MappingMethod::DeviceProxy, MappingMethod::Iptables] {
        let group: Vec<Port> = ports
            .iter()
            .filter(|p| p.active && p.mapping_method == method)
            .cloned()
            .collect();
        if group.is_empty() {
            continue;
        }
        let plans = compact_plans(&group);
        match method {
            MappingMethod::DeviceProxy => {
                apply_device_proxy(session, cli, instance_name, host_ip, guest_ip, &plans).await?;
            }
            MappingMethod::Iptables => {
                apply_iptables(session, host_ip, guest_ip, &plans).await?;
            }
            MappingMethod::Native => unreachable!(),
        }
    }
    Ok(())
}

/// `-p host:guest/proto` flags for an instance's `native`-method ports, for
/// adapters (Docker) that publish ports at container-create time rather
/// than through a separate device or iptables rule. `both` expands into one
/// TCP and one UDP flag, same as the other two backends (spec §9 open
/// question 1).
pub fn native_port_flags(ports: &[Port]) -> Vec<String> {
    let mut flags = Vec::new();
    for port in ports.iter().filter(|p| p.active && p.mapping_method == MappingMethod::Native) {
        match port.protocol {
            Protocol::Both => {
                flags.push(format!("-p {}:{}/tcp", port.host_port, port.guest_port));
                flags.push(format!("-p {}:{}/udp", port.host_port, port.guest_port));
            }
            other => flags.push(format!("-p {}:{}/{}", port.host_port, port.guest_port, protocol_tag(other))),
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_utils::{InstanceId, PortId};

    fn port(id: i64, host: u16, guest: u16, is_ssh: bool) -> Port {
        Port {
            id: PortId(id),
            instance_id: InstanceId(1),
            host_port: host,
            guest_port: guest,
            protocol: Protocol::Tcp,
            mapping_method: MappingMethod::DeviceProxy,
            is_ssh,
            active: true,
        }
    }

    #[test]
    fn compacts_contiguous_identity_mapped_range() {
        let ports = vec![
            port(1, 20001, 20001, false),
            port(2, 20002, 20002, false),
            port(3, 20003, 20003, false),
            port(4, 22001, 22, true),
        ];
        let plans = compact_plans(&ports);
        assert_eq!(plans.len(), 2);
        assert!(plans[0].is_ssh);
        assert_eq!(plans[0].host_start, 22001);
        assert!(!plans[1].is_ssh);
        assert_eq!(plans[1].host_start, 20001);
        assert_eq!(plans[1].host_end, 20003);
        assert_eq!(plans[1].device_name(), "tcp-range-20001-20003");
    }

    #[test]
    fn non_contiguous_ports_stay_separate() {
        let ports = vec![port(1, 8001, 8001, false), port(2, 8003, 8003, false)];
        let plans = compact_plans(&ports);
        assert_eq!(plans.len(), 2);
        assert!(!plans[0].is_range());
        assert!(!plans[1].is_range());
    }

    #[test]
    fn native_flags_expand_both_protocol_into_tcp_and_udp() {
        let mut tcp_only = port(1, 8080, 80, false);
        tcp_only.mapping_method = MappingMethod::Native;
        let mut both = port(2, 9090, 90, false);
        both.mapping_method = MappingMethod::Native;
        both.protocol = Protocol::Both;
        let mut inactive = port(3, 7000, 70, false);
        inactive.mapping_method = MappingMethod::Native;
        inactive.active = false;

        let flags = native_port_flags(&[tcp_only, both, inactive]);
        assert_eq!(flags, vec!["-p 8080:80/tcp", "-p 9090:90/tcp", "-p 9090:90/udp"]);
    }

    #[test]
    fn native_port_flags_ignores_non_native_ports() {
        let device_proxy_port = port(1, 8080, 80, false);
        assert!(native_port_flags(&[device_proxy_port]).is_empty());
    }
}
