//! Cluster membership and routing.
//!
//! The node list and partition tables are published through `ArcSwap` and
//! only ever replaced by the tend cycle, so commands read them without
//! locking. Anything a tend replaces is parked for one more tend before its
//! last tender-held reference is dropped.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, debug_span, warn};

use crate::{
    config::ClientConfig,
    error::{Error, Result, ResultCode},
    net::{tls::TlsContext, Host},
    wire::key::{partition_id, Key},
};

pub mod lookup;
pub mod node;
pub mod partition;
pub mod peers;
mod tend;
pub mod transport;

use node::{ConnectOptions, Node};
use partition::{PartitionTable, PartitionTables, Replica};
use transport::{InfoTransport, SocketInfoTransport};

/// Consecutive refresh failures after which a node is reported as
/// disconnected.
const MAX_FAILURES: u32 = 5;

/// Something a tend replaced, kept alive until the next tend.
enum Garbage {
    Nodes(Arc<Vec<Arc<Node>>>),
    Tables(Arc<PartitionTables>),
    Node(Arc<Node>),
}

pub(crate) struct ClusterInner {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn InfoTransport>,
    pub(crate) connect: Arc<ConnectOptions>,
    seeds: RwLock<Vec<Host>>,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    partition_tables: ArcSwap<PartitionTables>,
    n_partitions: AtomicU32,
    node_index: AtomicUsize,
    replica_index: AtomicUsize,
    garbage: Mutex<Vec<Garbage>>,
    tend_count: AtomicU64,
}

struct Tender {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// A connected cluster. Dropping it stops the tender and closes every node.
pub struct Cluster {
    pub(crate) inner: Arc<ClusterInner>,
    tender: Mutex<Option<Tender>>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.node_names())
            .field("n_partitions", &self.n_partitions())
            .finish()
    }
}

impl Cluster {
    /// Connects to the seeds over real sockets and starts the tender thread.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let tls = config
            .tls
            .as_ref()
            .map(TlsContext::new)
            .transpose()?
            .map(Arc::new);
        let transport = Arc::new(SocketInfoTransport::new(tls.clone(), config.stop_on_interrupt));
        let cluster = Self::create(config, transport, tls)?;
        cluster.start_tender()?;
        Ok(cluster)
    }

    /// Connects through `transport` without starting the tender; callers
    /// drive [`Cluster::tend`] themselves.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn InfoTransport>) -> Result<Self> {
        Self::create(config, transport, None)
    }

    fn create(
        config: ClientConfig,
        transport: Arc<dyn InfoTransport>,
        tls: Option<Arc<TlsContext>>,
    ) -> Result<Self> {
        if config.seeds.is_empty() {
            Err(Error::param("No seeds defined"))?
        }
        let connect = Arc::new(ConnectOptions {
            tls,
            conn_timeout: config.conn_timeout,
            max_socket_idle: config.max_socket_idle,
            stop_on_interrupt: config.stop_on_interrupt,
        });
        let inner = Arc::new(ClusterInner {
            seeds: RwLock::new(config.seeds.clone()),
            config,
            transport,
            connect,
            nodes: ArcSwap::from_pointee(Vec::new()),
            partition_tables: ArcSwap::from_pointee(PartitionTables::new()),
            n_partitions: AtomicU32::new(0),
            node_index: AtomicUsize::new(0),
            replica_index: AtomicUsize::new(0),
            garbage: Mutex::new(Vec::new()),
            tend_count: AtomicU64::new(0),
        });

        if let Err(e) = inner.wait_till_stabilized() {
            if inner.config.fail_if_not_connected {
                inner.close();
                return Err(e);
            }
            warn!("Cluster connection failed: {}", e);
        }
        inner.add_seeds();

        Ok(Self {
            inner,
            tender: Mutex::new(None),
        })
    }

    /// Starts the background tender. Calling it twice is a no-op.
    pub fn start_tender(&self) -> Result<()> {
        let mut tender = self.tender.lock();
        if tender.is_some() {
            return Ok(());
        }
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let inner = self.inner.clone();
        let signal = shutdown.clone();
        let handle = thread::Builder::new()
            .name("synapse-tend".into())
            .spawn(move || {
                let _span = debug_span!("tender").entered();
                let (lock, cvar) = &*signal;
                let mut stopped = lock.lock();
                while !*stopped {
                    if let Err(e) = inner.tend(false) {
                        warn!("Tend error: {}", e);
                    }
                    cvar.wait_for(&mut stopped, inner.config.tend_interval);
                }
                debug!("tender stopped");
            })?;
        *tender = Some(Tender { shutdown, handle });
        Ok(())
    }

    /// Runs one tend cycle on the calling thread.
    pub fn tend(&self) -> Result<()> {
        self.inner.tend(false)
    }

    pub fn tend_count(&self) -> u64 {
        self.inner.tend_count.load(Ordering::Relaxed)
    }

    /// Snapshot of the current nodes.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.inner.nodes.load_full()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner
            .nodes
            .load()
            .iter()
            .map(|node| node.name().to_owned())
            .collect()
    }

    pub fn get_node(&self, name: &str) -> Result<Arc<Node>> {
        self.inner.find_node(name).ok_or_else(|| {
            Error::new(ResultCode::InvalidNode, format!("Invalid node name {}", name))
        })
    }

    /// Next active node in round-robin order.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        self.inner.random_node()
    }

    /// True while at least one node answers its refreshes.
    pub fn is_connected(&self) -> bool {
        self.inner
            .nodes
            .load()
            .iter()
            .any(|node| node.is_active() && node.failures() < MAX_FAILURES)
    }

    pub fn n_partitions(&self) -> u32 {
        self.inner.n_partitions()
    }

    pub fn partition_table(&self, namespace: &str) -> Option<Arc<PartitionTable>> {
        self.inner.partition_tables.load().get(namespace).cloned()
    }

    /// Node a command for `key` should be sent to on its `attempt`-th try.
    pub fn node_for_key(&self, key: &Key, replica: Replica, attempt: u32) -> Result<Arc<Node>> {
        self.inner.node_for_key(key, replica, attempt)
    }

    pub fn seeds(&self) -> Vec<Host> {
        self.inner.seeds.read().clone()
    }

    /// Stops the tender and closes every node. Safe to call more than once.
    pub fn close(&self) {
        if let Some(tender) = self.tender.lock().take() {
            let (lock, cvar) = &*tender.shutdown;
            *lock.lock() = true;
            cvar.notify_all();
            if tender.handle.join().is_err() {
                warn!("tender thread panicked");
            }
        }
        self.inner.close();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClusterInner {
    pub(crate) fn n_partitions(&self) -> u32 {
        self.n_partitions.load(Ordering::Acquire)
    }

    pub(crate) fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    pub(crate) fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .find(|node| node.name() == name)
            .cloned()
    }

    pub(crate) fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes.load();
        let start = self.node_index.fetch_add(1, Ordering::Relaxed);
        (0..nodes.len())
            .map(|i| &nodes[(start + i) % nodes.len()])
            .find(|node| node.is_active())
            .cloned()
            .ok_or_else(|| Error::new(ResultCode::InvalidNode, "Cluster is empty"))
    }

    pub(crate) fn node_for_key(&self, key: &Key, replica: Replica, attempt: u32) -> Result<Arc<Node>> {
        let tables = self.partition_tables.load();
        let node = tables.get(&key.namespace).and_then(|table| {
            table.get_node(&key.digest, replica, attempt % 2 == 0, &self.replica_index)
        });
        match node {
            Some(node) => Ok(node),
            None => {
                let pid = partition_id(&key.digest, self.n_partitions() as u16);
                debug!(namespace = %key.namespace, pid, "partition not mapped, using any node");
                self.random_node()
            }
        }
    }

    /// Appends node addresses missing from the seed list so that a later
    /// reseed can reach nodes learned through peers.
    pub(crate) fn add_seeds(&self) {
        let nodes = self.nodes.load();
        let mut seeds = self.seeds.write();
        for seed in seeds.iter() {
            debug!("Add seed {}", seed);
        }
        for node in nodes.iter() {
            for addr in node.addresses() {
                if !seeds.iter().any(|seed| seed_matches(seed, &addr)) {
                    let mut host = Host::new(addr.ip().to_string(), addr.port());
                    if let Some(tls_name) = node.tls_name() {
                        host = host.with_tls_name(tls_name);
                    }
                    debug!("Add seed {}", host);
                    seeds.push(host);
                }
            }
        }
    }

    fn park(&self, item: Garbage) {
        self.garbage.lock().push(item);
    }

    /// Releases what the previous tend replaced. Removed nodes close their
    /// pools here; connections still checked out close when returned.
    fn collect_garbage(&self) {
        for item in std::mem::take(&mut *self.garbage.lock()) {
            match item {
                Garbage::Node(node) => node.close(),
                Garbage::Nodes(_) | Garbage::Tables(_) => {}
            }
        }
    }

    /// Keeps calling tend until the node count stops changing or the
    /// connect timeout passes.
    fn wait_till_stabilized(&self) -> Result<()> {
        let limit = Instant::now() + self.config.conn_timeout;
        let mut count = None;
        loop {
            self.tend(true)?;
            let len = self.nodes.load().len();
            if count == Some(len) {
                return Ok(());
            }
            count = Some(len);
            if Instant::now() >= limit {
                return Ok(());
            }
            thread::sleep(Duration::from_micros(1));
        }
    }

    fn close(&self) {
        let nodes = self.nodes.swap(Arc::new(Vec::new()));
        for node in nodes.iter() {
            node.close();
        }
        self.collect_garbage();
    }
}

fn seed_matches(seed: &Host, addr: &SocketAddr) -> bool {
    seed.port == addr.port()
        && seed
            .name
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip == addr.ip())
}
