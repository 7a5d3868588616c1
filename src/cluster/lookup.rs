use std::net::SocketAddr;

use tracing::{debug, info, warn};

use super::{node::features, transport::InfoTransport};
use crate::{
    config::ClientConfig,
    error::{Error, Result},
    net::{Deadline, Host, DEFAULT_PORT},
};

/// Identity of a server confirmed by a successful handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub features: u32,
    pub host: Host,
    /// Address the node answered on, after load balancer correction.
    pub addr: SocketAddr,
    pub is_alias: bool,
}

/// Info command that lists the node's own service addresses.
pub fn service_command(config: &ClientConfig) -> &'static str {
    match (config.tls_enabled(), config.use_services_alternate) {
        (true, true) => "service-tls-alt",
        (true, false) => "service-tls-std",
        (false, true) => "service-clear-alt",
        (false, false) => "service-clear-std",
    }
}

/// Resolves `host` and validates its addresses in turn, returning the first
/// node whose name matches `expected_name` (any name when `None`).
pub fn lookup_host(
    transport: &dyn InfoTransport,
    config: &ClientConfig,
    host: &Host,
    expected_name: Option<&str>,
    deadline: Deadline,
) -> Result<NodeInfo> {
    let (addrs, is_alias) = transport.resolve(host)?;
    let mut last = None;
    for addr in addrs {
        match lookup_node(transport, config, host, addr, deadline) {
            Ok(mut info) => match expected_name {
                Some(expected) if expected != info.name => {
                    warn!(
                        "Peer node {} is different than actual node {} for host {}",
                        expected, info.name, host
                    );
                    last = Some(Error::client(format!(
                        "Peer node {} is different than actual node {}",
                        expected, info.name
                    )));
                }
                _ => {
                    info.is_alias = is_alias;
                    return Ok(info);
                }
            },
            Err(e) => {
                warn!("Failed to connect to {} {}: {}", host, addr, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::client(format!("No addresses for host {}", host))))
}

/// Validates a single address: asks for the node name and features, checks
/// the cluster name and, when enabled, whether the address is really a load
/// balancer in front of the node.
pub fn lookup_node(
    transport: &dyn InfoTransport,
    config: &ClientConfig,
    host: &Host,
    addr: SocketAddr,
    deadline: Deadline,
) -> Result<NodeInfo> {
    let tls_name = host.tls_name.as_deref();
    let detect_lb = config.detect_load_balancer;

    let mut names = String::from("node\nfeatures\n");
    if config.cluster_name.is_some() {
        names.push_str("cluster-name\n");
    }
    if detect_lb {
        names.push_str(service_command(config));
        names.push('\n');
    }

    let resp = transport.info(addr, tls_name, &names, deadline)?;
    let invalid = || {
        Error::client(format!(
            "Invalid node info response from {}: {:?}",
            addr, resp.0
        ))
    };
    let name = match resp.get("node") {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => return Err(invalid()),
    };
    if let Some(expected) = config.cluster_name.as_deref() {
        let received = resp.get("cluster-name").ok_or_else(invalid)?;
        if received != expected {
            Err(Error::client(format!(
                "Invalid node {} {} Expected cluster name '{}' Received '{}'",
                name, addr, expected, received
            )))?
        }
    }
    let features = features::parse(resp.get("features").ok_or_else(invalid)?);

    let addr = match resp.get(service_command(config)) {
        Some(services) if detect_lb => {
            resolve_load_balancer(transport, tls_name, &name, addr, services, deadline)
        }
        _ => addr,
    };

    Ok(NodeInfo {
        name,
        features,
        host: host.clone(),
        addr,
        is_alias: false,
    })
}

/// If `addr` is not one of the node's advertised service addresses, the
/// connection probably went through a load balancer. Each advertised address
/// is probed and the first one reporting the same node name replaces
/// `addr`. Without a match the original address is kept.
fn resolve_load_balancer(
    transport: &dyn InfoTransport,
    tls_name: Option<&str>,
    name: &str,
    addr: SocketAddr,
    services: &str,
    deadline: Deadline,
) -> SocketAddr {
    let hosts = match Host::parse_hosts(services, DEFAULT_PORT) {
        Ok(hosts) => hosts,
        Err(_) => return addr,
    };
    let mut candidates = Vec::new();
    for host in &hosts {
        match transport.resolve(host) {
            Ok((addrs, _)) => candidates.extend(addrs),
            Err(e) => debug!("skipping service host {}: {}", host, e),
        }
    }
    if candidates.is_empty() || candidates.contains(&addr) {
        return addr;
    }

    for candidate in candidates {
        match transport.info(candidate, tls_name, "node\n", deadline) {
            Ok(resp) if resp.get("node") == Some(name) => {
                info!(
                    "Node {} seed {} is not a service address, switching to {}",
                    name, addr, candidate
                );
                return candidate;
            }
            Ok(resp) => debug!(
                "service address {} belongs to {:?}, not {}",
                candidate,
                resp.get("node"),
                name
            ),
            Err(e) => {
                transport.forget(candidate);
                debug!("service address {} unreachable: {}", candidate, e)
            }
        }
    }
    addr
}
