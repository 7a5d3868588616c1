//! The tend cycle: seeding, node refresh, peer discovery, partition map
//! refresh and node removal.

use std::{
    net::{IpAddr, SocketAddr},
    sync::{atomic::Ordering, Arc},
};

use tracing::{debug, info, warn};

use super::{
    lookup::{lookup_host, lookup_node, NodeInfo},
    node::{features, Node},
    partition::{self, ReplicasFormat},
    peers::{self, PeerList, Peers},
    ClusterInner, Garbage, MAX_FAILURES,
};
use crate::{
    error::{Error, Result},
    net::{Deadline, Host},
    wire::info::InfoResponse,
};

const CHECK_PEERS: &str = "node\npeers-generation\npartition-generation\n";
const CHECK_SERVICES: &str = "node\npartition-generation\nservices\n";
const CHECK_SERVICES_ALT: &str = "node\npartition-generation\nservices-alternate\n";

impl ClusterInner {
    fn deadline(&self) -> Deadline {
        Deadline::after(self.config.conn_timeout)
    }

    pub(crate) fn tend(&self, enable_seed_warnings: bool) -> Result<()> {
        self.collect_garbage();

        if self.nodes.load().is_empty() {
            self.seed_nodes(enable_seed_warnings)?;
        }
        if self.n_partitions() == 0 {
            self.set_partition_size()?;
        }

        let nodes = self.nodes.load_full();
        let mut peers = Peers::default();
        for node in nodes.iter() {
            node.friends.store(0, Ordering::Release);
            node.partition_changed.store(false, Ordering::Release);
            if !node.has_feature(features::PEERS) {
                peers.use_peers = false;
            }
        }

        let mut refresh_count = 0u32;
        for node in nodes.iter().filter(|node| node.is_active()) {
            match self.refresh_node(node, &mut peers) {
                Ok(()) => {
                    node.failures.store(0, Ordering::Release);
                    refresh_count += 1;
                }
                Err(e) => {
                    info!("Node {} refresh failed: {}", node, e);
                    node.failures.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        if peers.gen_changed {
            // only nodes whose peers were read count as refreshed
            refresh_count = 0;
            for node in nodes.iter() {
                if node.failures() != 0 || !node.is_active() {
                    continue;
                }
                match self.refresh_peers(node, &mut peers) {
                    Ok(()) => refresh_count += 1,
                    Err(e) => {
                        warn!("Node {} peers refresh failed: {}", node, e);
                        node.failures.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }

        for node in nodes.iter() {
            // a node without peers may be split from the rest of the cluster
            if node.partition_changed.load(Ordering::Acquire)
                && node.failures() == 0
                && node.is_active()
                && (node.peers_count() > 0 || refresh_count == 1)
            {
                if let Err(e) = self.refresh_partitions(node) {
                    warn!("Node {} partition refresh failed: {}", node, e);
                    node.failures.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        if peers.gen_changed || !peers.use_peers {
            let to_remove = self.find_nodes_to_remove(&nodes, refresh_count);
            if !to_remove.is_empty() {
                self.remove_nodes(&to_remove);
            }
        }
        if !peers.nodes.is_empty() {
            self.add_nodes(std::mem::take(&mut peers.nodes));
        }

        for node in self.nodes.load().iter() {
            node.process_recovering();
            node.trim_connections();
        }
        self.tend_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn create_node(&self, info: NodeInfo) -> Arc<Node> {
        Arc::new(Node::new(
            info,
            self.connect.clone(),
            self.config.max_conns_per_node,
            self.config.conn_pools_per_node,
        ))
    }

    /// Validates every address of every seed. Seeds that resolve to the same
    /// node are merged into one node with several addresses.
    fn seed_nodes(&self, enable_warnings: bool) -> Result<()> {
        let seeds = self.seeds.read().clone();
        let mut to_add: Vec<Arc<Node>> = Vec::new();

        for seed in &seeds {
            let (addrs, is_alias) = match self.transport.resolve(seed) {
                Ok(resolved) => resolved,
                Err(e) => {
                    if enable_warnings {
                        warn!("Failed to lookup {}: {}", seed, e);
                    }
                    continue;
                }
            };
            for addr in addrs {
                match lookup_node(&*self.transport, &self.config, seed, addr, self.deadline()) {
                    Ok(mut info) => match to_add.iter().find(|node| node.name() == info.name) {
                        Some(node) => {
                            node.add_address(info.addr);
                            if is_alias {
                                node.add_alias(seed);
                            }
                        }
                        None => {
                            info.is_alias = is_alias;
                            to_add.push(self.create_node(info));
                        }
                    },
                    Err(e) => {
                        if enable_warnings {
                            warn!("Failed to connect to seed {} {}: {}", seed, addr, e);
                        }
                    }
                }
            }
        }

        if to_add.is_empty() {
            Err(Error::client("Failed to connect"))?
        }
        self.add_nodes(to_add);
        Ok(())
    }

    /// Reads the fixed partition count from the first node that answers.
    fn set_partition_size(&self) -> Result<()> {
        let nodes = self.nodes.load_full();
        let mut last = None;
        for node in nodes.iter() {
            let resp = match node.info(&*self.transport, "partitions\n", self.deadline()) {
                Ok(resp) => resp,
                Err(e) => {
                    last = Some(e);
                    continue;
                }
            };
            match resp.get("partitions").and_then(|v| v.parse::<u32>().ok()) {
                Some(n) if n > 0 => {
                    self.n_partitions.store(n, Ordering::Release);
                    debug!(n_partitions = n, "partition count");
                    return Ok(());
                }
                _ => {
                    last = Some(Error::client(format!(
                        "Invalid partitions info response from node {}: {:?}",
                        node.name(),
                        resp.0
                    )))
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::client("Failed to retrieve partition size from empty cluster")
        }))
    }

    fn not_requested(node: &Node, name: &str) -> Error {
        Error::client(format!("Node {} did not request info '{}'", node.name(), name))
    }

    /// Checks name and generations. Falls back to the legacy services list
    /// when some node does not speak the peers protocol.
    fn refresh_node(&self, node: &Arc<Node>, peers: &mut Peers) -> Result<()> {
        let command = match (peers.use_peers, self.config.use_services_alternate) {
            (true, _) => CHECK_PEERS,
            (false, true) => CHECK_SERVICES_ALT,
            (false, false) => CHECK_SERVICES,
        };
        let resp = node.info(&*self.transport, command, self.deadline())?;
        self.process_refresh(node, peers, &resp).map_err(|e| {
            self.transport.forget(node.address());
            e
        })
    }

    fn process_refresh(&self, node: &Arc<Node>, peers: &mut Peers, resp: &InfoResponse) -> Result<()> {
        node.verify_name(resp.get("node").unwrap_or_default())?;
        for (name, value) in resp.iter() {
            match name {
                "node" => {}
                "peers-generation" => {
                    let generation = parse_generation(node, name, value)?;
                    if node.peers_generation() != generation {
                        debug!("Node {} peers generation changed: {}", node.name(), generation);
                        peers.gen_changed = true;
                    }
                }
                "partition-generation" => {
                    let generation = parse_generation(node, name, value)?;
                    if node.partition_generation() != generation {
                        debug!("Node {} partition generation changed: {}", node.name(), generation);
                        node.partition_changed.store(true, Ordering::Release);
                    }
                }
                "services" | "services-alternate" => self.apply_services(node, peers, value),
                _ => Err(Self::not_requested(node, name))?,
            }
        }
        Ok(())
    }

    fn peers_command(&self) -> &'static str {
        match (self.config.tls_enabled(), self.config.use_services_alternate) {
            (true, true) => "peers-tls-alt",
            (true, false) => "peers-tls-std",
            (false, true) => "peers-clear-alt",
            (false, false) => "peers-clear-std",
        }
    }

    fn refresh_peers(&self, node: &Arc<Node>, peers: &mut Peers) -> Result<()> {
        let command = self.peers_command();
        let resp = node.info(&*self.transport, &format!("{}\n", command), self.deadline())?;
        for (name, value) in resp.iter() {
            if name != command {
                Err(Self::not_requested(node, name))?
            }
            let list = peers::parse_peers(value)?;
            self.apply_peers(node, peers, list);
        }
        Ok(())
    }

    /// Registers the peers `node` reports. Known peers only count as
    /// friends; unknown ones are validated host by host until one answers
    /// with the advertised name.
    fn apply_peers(&self, node: &Arc<Node>, peers: &mut Peers, list: PeerList) {
        node.peers_count.store(0, Ordering::Release);
        for peer in &list.peers {
            node.peers_count.fetch_add(1, Ordering::AcqRel);
            let known = self
                .find_node(&peer.name)
                .or_else(|| peers.find_local(&peer.name).cloned());
            if let Some(known) = known {
                known.friends.fetch_add(1, Ordering::AcqRel);
                continue;
            }

            for host in &peer.hosts {
                if peers.invalid_hosts.contains(host) {
                    continue;
                }
                match lookup_host(
                    &*self.transport,
                    &self.config,
                    host,
                    Some(&peer.name),
                    self.deadline(),
                ) {
                    Ok(info) => {
                        peers.nodes.push(self.create_node(info));
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to validate peer {} {}: {}", peer.name, host, e);
                        peers.invalid_hosts.insert(host.clone());
                    }
                }
            }
        }
        node.peers_generation.store(list.generation, Ordering::Release);
    }

    /// Legacy `services` handling for servers without the peers protocol.
    fn apply_services(&self, node: &Arc<Node>, peers: &mut Peers, value: &str) {
        node.peers_count.store(0, Ordering::Release);
        for host in peers::parse_services(value) {
            node.peers_count.fetch_add(1, Ordering::AcqRel);
            if host.port == 0 {
                warn!("Invalid port: {}", host);
                continue;
            }
            if let Some(known) = self.find_node_by_host(&host) {
                known.friends.fetch_add(1, Ordering::AcqRel);
                continue;
            }
            if peers.hosts.contains(&host) || peers.invalid_hosts.contains(&host) {
                continue;
            }
            match lookup_host(&*self.transport, &self.config, &host, None, self.deadline()) {
                Ok(info) => self.prepare_services_node(peers, &host, info),
                Err(e) => {
                    warn!("Failed to validate service {}: {}", host, e);
                    peers.invalid_hosts.insert(host);
                }
            }
        }
    }

    fn find_node_by_host(&self, host: &Host) -> Option<Arc<Node>> {
        let nodes = self.nodes.load();
        match host.name.parse::<IpAddr>() {
            Ok(ip) => {
                let addr = SocketAddr::new(ip, host.port);
                nodes.iter().find(|node| node.has_address(&addr)).cloned()
            }
            Err(_) => nodes
                .iter()
                .find(|node| node.has_alias(&host.name, host.port))
                .cloned(),
        }
    }

    /// A services list may name the same node under several addresses.
    /// Duplicates only add the address to the node already known.
    fn prepare_services_node(&self, peers: &mut Peers, host: &Host, info: NodeInfo) {
        peers.hosts.insert(host.clone());
        let duplicate = |node: &Node| {
            info!(
                "Node {} already exists with nodeid {} and address {}",
                host,
                node.name(),
                node.address()
            );
            node.add_address(info.addr);
            if info.is_alias {
                node.add_alias(host);
            }
        };
        if let Some(node) = peers.find_local(&info.name) {
            duplicate(node);
            return;
        }
        if let Some(node) = self.find_node(&info.name) {
            duplicate(&node);
            node.friends.fetch_add(1, Ordering::AcqRel);
            return;
        }
        peers.nodes.push(self.create_node(info));
    }

    /// Reloads the partition map of `node`. A malformed map is logged and
    /// skipped; the generation is left stale so the next tend retries.
    fn refresh_partitions(&self, node: &Arc<Node>) -> Result<()> {
        let command = if node.has_feature(features::REPLICAS) {
            "partition-generation\nreplicas\n"
        } else if node.has_feature(features::REPLICAS_ALL) {
            "partition-generation\nreplicas-all\n"
        } else {
            "partition-generation\nreplicas-master\nreplicas-prole\n"
        };
        let resp = node.info(&*self.transport, command, self.deadline())?;
        let n_partitions = self.n_partitions() as usize;

        let mut generation = None;
        let mut updates = Vec::new();
        for (name, value) in resp.iter() {
            let format = match name {
                "partition-generation" => {
                    generation = Some(parse_generation(node, name, value)?);
                    continue;
                }
                "replicas" => ReplicasFormat::Regime,
                "replicas-all" => ReplicasFormat::All,
                "replicas-master" => ReplicasFormat::Level(0),
                "replicas-prole" => ReplicasFormat::Level(1),
                _ => Err(Self::not_requested(node, name))?,
            };
            match partition::parse_replicas(value, format, n_partitions) {
                Ok(parsed) => updates.extend(parsed),
                Err(e) => {
                    warn!("Node {}: {}", node, e);
                    return Ok(());
                }
            }
        }

        let tables = self.partition_tables.load_full();
        let added = partition::apply_replicas(&tables, &updates, node, n_partitions);
        if !added.is_empty() {
            let mut copy = (*tables).clone();
            for table in added {
                debug!(namespace = table.namespace(), "new partition table");
                copy.insert(table.namespace().to_owned(), table);
            }
            let old = self.partition_tables.swap(Arc::new(copy));
            self.park(Garbage::Tables(old));
        }
        if let Some(generation) = generation {
            node.partition_generation.store(generation, Ordering::Release);
        }
        Ok(())
    }

    fn find_nodes_to_remove(&self, nodes: &[Arc<Node>], refresh_count: u32) -> Vec<Arc<Node>> {
        let tables = self.partition_tables.load();
        let mut to_remove = Vec::new();
        for node in nodes {
            if !node.is_active() {
                to_remove.push(node.clone());
                continue;
            }
            let friends = node.friends.load(Ordering::Acquire);
            let failures = node.failures();
            let remove = match nodes.len() {
                // a lone node that keeps failing is replaced by reseeding
                1 => failures >= MAX_FAILURES && self.seed_nodes(false).is_ok(),
                2 => refresh_count == 1 && friends == 0 && failures > 0,
                _ => {
                    refresh_count >= 1
                        && friends == 0
                        && (failures > 0 || !partition::tables_contain_node(&tables, node))
                }
            };
            if remove {
                to_remove.push(node.clone());
            }
        }
        to_remove
    }

    fn remove_nodes(&self, to_remove: &[Arc<Node>]) {
        for node in to_remove {
            node.deactivate();
        }
        let old = self.nodes.load_full();
        let mut kept = Vec::with_capacity(old.len());
        for node in old.iter() {
            // reseeding can leave two nodes with one name, so match by pointer
            if to_remove.iter().any(|r| Arc::ptr_eq(r, node)) {
                info!("Remove node {}", node);
                self.park(Garbage::Node(node.clone()));
            } else {
                kept.push(node.clone());
            }
        }
        let old = self.nodes.swap(Arc::new(kept));
        self.park(Garbage::Nodes(old));
    }

    fn add_nodes(&self, to_add: Vec<Arc<Node>>) {
        for node in &to_add {
            info!("Add node {}", node);
        }
        let old = self.nodes.load_full();
        let mut nodes = Vec::with_capacity(old.len() + to_add.len());
        nodes.extend(old.iter().cloned());
        nodes.extend(to_add);
        let old = self.nodes.swap(Arc::new(nodes));
        self.park(Garbage::Nodes(old));
    }
}

fn parse_generation(node: &Node, name: &str, value: &str) -> Result<u32> {
    value.trim().parse().map_err(|_| {
        Error::client(format!(
            "Node {} returned invalid {} '{}'",
            node.name(),
            name,
            value
        ))
    })
}
