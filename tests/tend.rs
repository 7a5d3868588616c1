//! Cluster discovery and partition map maintenance against an in-process
//! fake of the info protocol.

use std::{net::SocketAddr, sync::Arc};

use base64::Engine as _;
use hashbrown::HashMap;
use parking_lot::Mutex;
use synapse::{
    cluster::transport::InfoTransport,
    net::Deadline,
    wire::info::InfoResponse,
    ClientConfig, Cluster, Error, Host, Key, Replica, Result, ResultCode, UserKey,
};

const N_PARTITIONS: usize = 4096;

#[derive(Clone, Default)]
struct FakeNode {
    name: String,
    cluster_name: String,
    features: String,
    services: String,
    peers_generation: u32,
    peers: String,
    partition_generation: u32,
    replicas: String,
}

impl FakeNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            cluster_name: "prod".to_owned(),
            features: "peers;replicas;pipelining".to_owned(),
            peers_generation: 1,
            peers: "1,,[]".to_owned(),
            partition_generation: 1,
            ..Default::default()
        }
    }

    fn value(&self, name: &str) -> Option<String> {
        Some(match name {
            "node" => self.name.clone(),
            "features" => self.features.clone(),
            "cluster-name" => self.cluster_name.clone(),
            "service-clear-std" => self.services.clone(),
            "partitions" => N_PARTITIONS.to_string(),
            "peers-generation" => self.peers_generation.to_string(),
            "partition-generation" => self.partition_generation.to_string(),
            "peers-clear-std" => self.peers.clone(),
            "replicas" => self.replicas.clone(),
            _ => return None,
        })
    }
}

/// Nodes by address. Several addresses may answer for one node.
#[derive(Default)]
struct FakeCluster {
    nodes: Mutex<HashMap<SocketAddr, FakeNode>>,
    requests: Mutex<Vec<(SocketAddr, String)>>,
}

impl FakeCluster {
    fn add(&self, addr: &str, node: FakeNode) {
        self.nodes.lock().insert(addr.parse().unwrap(), node);
    }

    fn update(&self, addr: &str, f: impl FnOnce(&mut FakeNode)) {
        let addr: SocketAddr = addr.parse().unwrap();
        f(self.nodes.lock().get_mut(&addr).unwrap());
    }

    fn take_requests(&self) -> Vec<(SocketAddr, String)> {
        std::mem::take(&mut *self.requests.lock())
    }
}

impl InfoTransport for FakeCluster {
    fn info(
        &self,
        addr: SocketAddr,
        _tls_name: Option<&str>,
        names: &str,
        _deadline: Deadline,
    ) -> Result<InfoResponse> {
        self.requests.lock().push((addr, names.to_owned()));
        let nodes = self.nodes.lock();
        let node = nodes
            .get(&addr)
            .ok_or_else(|| Error::connection(format!("Connection refused: {}", addr)))?;
        let mut text = String::new();
        for name in names.split('\n').filter(|n| !n.is_empty()) {
            if let Some(value) = node.value(name) {
                text.push_str(&format!("{}\t{}\n", name, value));
            }
        }
        Ok(InfoResponse::parse(&text))
    }
}

/// `test:regime,2,master,prole` where the node owns the partitions
/// `owns(pid)` picks as master and the rest as prole.
fn replicas(owns: impl Fn(usize) -> bool) -> String {
    let mut master = vec![0u8; (N_PARTITIONS + 7) / 8];
    let mut prole = master.clone();
    for pid in 0..N_PARTITIONS {
        let bitmap = if owns(pid) { &mut master } else { &mut prole };
        bitmap[pid >> 3] |= 0x80 >> (pid & 7);
    }
    let b64 = base64::engine::general_purpose::STANDARD;
    format!("test:1,2,{},{}", b64.encode(&master), b64.encode(&prole))
}

fn config(seed: &str) -> ClientConfig {
    let addr: SocketAddr = seed.parse().unwrap();
    ClientConfig::builder()
        .seeds(vec![Host::new(addr.ip().to_string(), addr.port())])
        .cluster_name("prod")
        .detect_load_balancer(false)
        .build()
}

fn two_nodes() -> Arc<FakeCluster> {
    let fake = Arc::new(FakeCluster::default());
    let mut a = FakeNode::new("A");
    a.peers = "1,,[[B,,[10.0.0.2]]]".to_owned();
    a.replicas = replicas(|pid| pid % 2 == 0);
    let mut b = FakeNode::new("B");
    b.peers = "1,3000,[[A,,[10.0.0.1:3000]]]".to_owned();
    b.replicas = replicas(|pid| pid % 2 == 1);
    fake.add("10.0.0.1:3000", a);
    fake.add("10.0.0.2:3000", b);
    fake
}

#[test]
fn discovers_peers_and_maps_every_partition() {
    let fake = two_nodes();
    let cluster = Cluster::with_transport(config("10.0.0.1:3000"), fake.clone()).unwrap();

    let mut names = cluster.node_names();
    names.sort();
    assert_eq!(names, ["A", "B"]);
    assert_eq!(cluster.n_partitions(), N_PARTITIONS as u32);
    assert!(cluster.is_connected());

    let table = cluster.partition_table("test").unwrap();
    assert_eq!(table.len(), N_PARTITIONS);
    for pid in 0..N_PARTITIONS {
        let (master, prole) = if pid % 2 == 0 { ("A", "B") } else { ("B", "A") };
        assert_eq!(table.master(pid).unwrap().name(), master, "pid {}", pid);
        assert_eq!(table.prole(pid).unwrap().name(), prole, "pid {}", pid);
    }

    let key = Key::new("test", "demo", UserKey::Str("k".into())).unwrap();
    let master = cluster.node_for_key(&key, Replica::Master, 0).unwrap();
    let prole = cluster.node_for_key(&key, Replica::Sequence, 1).unwrap();
    assert_ne!(master.name(), prole.name());
}

#[test]
fn unchanged_generations_skip_peer_and_partition_refresh() {
    let fake = two_nodes();
    let cluster = Cluster::with_transport(config("10.0.0.1:3000"), fake.clone()).unwrap();
    fake.take_requests();

    cluster.tend().unwrap();
    let requests = fake.take_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests
        .iter()
        .all(|(_, names)| names == "node\npeers-generation\npartition-generation\n"));
    assert_eq!(cluster.nodes().len(), 2);

    // a new partition generation reloads only that node's map
    fake.update("10.0.0.2:3000", |b| b.partition_generation = 2);
    cluster.tend().unwrap();
    let reloads: Vec<_> = fake
        .take_requests()
        .into_iter()
        .filter(|(_, names)| names.contains("replicas"))
        .map(|(addr, _)| addr)
        .collect();
    assert_eq!(reloads, ["10.0.0.2:3000".parse::<SocketAddr>().unwrap()]);
    assert_eq!(cluster.get_node("B").unwrap().partition_generation(), 2);
}

#[test]
fn malformed_peers_are_retried_next_tend() {
    let fake = two_nodes();
    fake.update("10.0.0.1:3000", |a| a.peers = "1,,[[B,,[10.0.0.2]]".to_owned());
    let cluster = Cluster::with_transport(config("10.0.0.1:3000"), fake.clone()).unwrap();

    assert_eq!(cluster.node_names(), ["A"]);
    let a = cluster.get_node("A").unwrap();
    assert_eq!(a.peers_generation(), u32::MAX);
    assert!(a.failures() > 0);

    fake.update("10.0.0.1:3000", |a| a.peers = "1,,[[B,,[10.0.0.2]]]".to_owned());
    cluster.tend().unwrap();
    assert_eq!(cluster.nodes().len(), 2);
    assert_eq!(a.peers_generation(), 1);
}

#[test]
fn empty_peer_list_still_records_the_generation() {
    let fake = Arc::new(FakeCluster::default());
    let mut a = FakeNode::new("A");
    a.peers_generation = 5;
    a.peers = "5,3000,[]".to_owned();
    a.replicas = replicas(|_| true);
    fake.add("10.0.0.1:3000", a);

    let cluster = Cluster::with_transport(config("10.0.0.1:3000"), fake).unwrap();
    let a = cluster.get_node("A").unwrap();
    assert_eq!(a.peers_generation(), 5);
    assert_eq!(a.peers_count(), 0);
    // a single node without peers still maps its partitions
    let table = cluster.partition_table("test").unwrap();
    assert_eq!(table.master(0).unwrap().name(), "A");
}

#[test]
fn wrong_cluster_name_rejects_the_seed() {
    let fake = Arc::new(FakeCluster::default());
    let mut a = FakeNode::new("A");
    a.cluster_name = "staging".to_owned();
    fake.add("10.0.0.1:3000", a);

    let err = Cluster::with_transport(config("10.0.0.1:3000"), fake).unwrap_err();
    assert_eq!(err.code, ResultCode::Client);
    assert_eq!(err.message, "Failed to connect");
}

#[test]
fn load_balancer_seed_is_replaced_by_the_service_address() {
    let fake = Arc::new(FakeCluster::default());
    let mut a = FakeNode::new("A");
    a.services = "10.0.0.1:3000".to_owned();
    a.replicas = replicas(|_| true);
    // the balancer forwards to A, which advertises its own address
    fake.add("10.9.9.9:3000", a.clone());
    fake.add("10.0.0.1:3000", a);

    let config = ClientConfig::builder()
        .seeds(vec![Host::new("10.9.9.9", 3000)])
        .build();
    let cluster = Cluster::with_transport(config, fake).unwrap();
    let a = cluster.get_node("A").unwrap();
    assert_eq!(a.address(), "10.0.0.1:3000".parse::<SocketAddr>().unwrap());
}
