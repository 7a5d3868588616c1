use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{lookup::NodeInfo, transport::InfoTransport};
use crate::{
    conn::{
        pool::{Connection, ConnectionPool},
        recover::{ConnRecover, DrainStatus},
    },
    error::{Error, Result, ResultCode},
    net::{tls::TlsContext, Deadline, Host, Socket},
    wire::info::InfoResponse,
};

/// Capabilities a node reports through the `features` info command.
pub mod features {
    pub const GEO: u32 = 1 << 0;
    pub const FLOAT: u32 = 1 << 1;
    pub const BATCH_INDEX: u32 = 1 << 2;
    pub const REPLICAS_ALL: u32 = 1 << 3;
    pub const PIPELINING: u32 = 1 << 4;
    pub const PEERS: u32 = 1 << 5;
    pub const REPLICAS: u32 = 1 << 6;
    pub const PARTITION_SCAN: u32 = 1 << 7;
    pub const QUERY_SHOW: u32 = 1 << 8;
    pub const BATCH_ANY: u32 = 1 << 9;
    pub const PARTITION_QUERY: u32 = 1 << 10;

    /// Parses the `;` separated feature list. Unknown features are ignored.
    pub fn parse(s: &str) -> u32 {
        s.split(';').fold(0, |acc, f| {
            acc | match f.trim() {
                "geo" => GEO,
                "float" => FLOAT,
                "batch-index" => BATCH_INDEX,
                "replicas-all" => REPLICAS_ALL,
                "pipelining" => PIPELINING,
                "peers" => PEERS,
                "replicas" => REPLICAS,
                "pscans" => PARTITION_SCAN,
                "query-show" => QUERY_SHOW,
                "batch-any" => BATCH_ANY,
                "pquery" => PARTITION_QUERY,
                _ => 0,
            }
        })
    }
}

/// Settings every node needs to open its own connections.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub tls: Option<Arc<TlsContext>>,
    pub conn_timeout: Duration,
    pub max_socket_idle: Duration,
    pub stop_on_interrupt: bool,
}

/// A connection whose abandoned response is still being drained.
struct Recovering {
    conn: Connection,
    recover: ConnRecover,
}

/// A cluster member.
///
/// Nodes are shared as `Arc<Node>`: the cluster's node list owns the primary
/// reference, commands and partition tables hold clones for as long as they
/// use the node. A removed node is deactivated first so that connections
/// returned to it are closed rather than pooled; its pools drain when the
/// last reference goes away.
pub struct Node {
    name: String,
    host: Host,
    features: u32,
    addresses: RwLock<Vec<SocketAddr>>,
    aliases: RwLock<Vec<Host>>,

    pub(crate) partition_generation: AtomicU32,
    pub(crate) peers_generation: AtomicU32,
    pub(crate) peers_count: AtomicU32,
    pub(crate) friends: AtomicU32,
    pub(crate) failures: AtomicU32,
    pub(crate) partition_changed: AtomicBool,
    active: AtomicBool,

    connect: Arc<ConnectOptions>,
    pools: Vec<ConnectionPool>,
    pool_index: AtomicUsize,
    recovering: Mutex<Vec<Recovering>>,
    conns_recovered: AtomicU64,
    conns_aborted: AtomicU64,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.address())
    }
}

impl Node {
    /// Builds a node from a validated lookup. `max_conns` is split evenly
    /// across `pool_count` pools.
    pub fn new(info: NodeInfo, connect: Arc<ConnectOptions>, max_conns: u32, pool_count: usize) -> Self {
        let pool_count = pool_count.max(1);
        let per_pool = (max_conns / pool_count as u32).max(1);
        let aliases = if info.is_alias {
            vec![info.host.clone()]
        } else {
            Vec::new()
        };
        Self {
            name: info.name,
            host: info.host,
            features: info.features,
            addresses: RwLock::new(vec![info.addr]),
            aliases: RwLock::new(aliases),
            partition_generation: AtomicU32::new(u32::MAX),
            peers_generation: AtomicU32::new(u32::MAX),
            peers_count: AtomicU32::new(0),
            friends: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            partition_changed: AtomicBool::new(false),
            active: AtomicBool::new(true),
            connect,
            pools: (0..pool_count).map(|_| ConnectionPool::new(per_pool)).collect(),
            pool_index: AtomicUsize::new(0),
            recovering: Mutex::new(Vec::new()),
            conns_recovered: AtomicU64::new(0),
            conns_aborted: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn tls_name(&self) -> Option<&str> {
        self.host.tls_name.as_deref()
    }

    /// Address used for new connections.
    pub fn address(&self) -> SocketAddr {
        self.addresses.read()[0]
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.read().clone()
    }

    pub fn aliases(&self) -> Vec<Host> {
        self.aliases.read().clone()
    }

    pub fn has_address(&self, addr: &SocketAddr) -> bool {
        self.addresses.read().contains(addr)
    }

    pub fn has_alias(&self, name: &str, port: u16) -> bool {
        self.aliases
            .read()
            .iter()
            .any(|alias| alias.name == name && alias.port == port)
    }

    pub fn add_address(&self, addr: SocketAddr) {
        let mut addresses = self.addresses.write();
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }

    pub fn add_alias(&self, host: &Host) {
        if !self.has_alias(&host.name, host.port) {
            self.aliases.write().push(host.clone());
        }
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub fn peers_generation(&self) -> u32 {
        self.peers_generation.load(Ordering::Acquire)
    }

    pub fn peers_count(&self) -> u32 {
        self.peers_count.load(Ordering::Acquire)
    }

    /// Marks the partition map as stale so the next tend reloads it.
    pub(crate) fn force_partition_refresh(&self) {
        self.partition_generation.store(u32::MAX, Ordering::Release);
    }

    /// Rejects a refresh response whose name differs from ours. A changed
    /// name means another server now answers on this address, so the node is
    /// deactivated immediately.
    pub fn verify_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            Err(Error::client("Node name not returned from info request."))?
        }
        if name != self.name {
            self.deactivate();
            Err(Error::client(format!(
                "Node name has changed. Old={} New={}",
                self.name, name
            )))?
        }
        Ok(())
    }

    /// Info request to this node through the tender's transport.
    pub fn info(
        &self,
        transport: &dyn InfoTransport,
        names: &str,
        deadline: Deadline,
    ) -> Result<InfoResponse> {
        let addr = self.address();
        transport
            .info(addr, self.tls_name(), names, deadline)
            .map_err(|e| {
                transport.forget(addr);
                e
            })
    }

    fn create_socket(&self, deadline: Deadline) -> Result<Socket> {
        let deadline = deadline.min(Deadline::after(self.connect.conn_timeout));
        let tls = self
            .connect
            .tls
            .as_deref()
            .map(|ctx| (ctx, self.tls_name().unwrap_or(&self.name)));
        Socket::connect(self.address(), tls, deadline, self.connect.stop_on_interrupt)
    }

    /// Checks out a connection, trying each pool once starting at a rotating
    /// offset.
    pub fn get_connection(&self, deadline: Deadline) -> Result<Connection> {
        let start = self.pool_index.fetch_add(1, Ordering::Relaxed);
        let mut last = None;
        for i in 0..self.pools.len() {
            let pool = (start + i) % self.pools.len();
            match self.pools[pool].get(self.connect.max_socket_idle, || self.create_socket(deadline)) {
                Ok((socket, is_new)) => {
                    if is_new {
                        trace!(node = %self.name, pool, "opened connection");
                    }
                    return Ok(Connection { socket, pool });
                }
                Err(e) if e.code == ResultCode::NoMoreConnections => last = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| {
            Error::new(
                ResultCode::NoMoreConnections,
                format!("Max node {} connections would be exceeded", self.name),
            )
        }))
    }

    /// Returns a healthy connection. Connections of a removed node are
    /// closed instead.
    pub fn put_connection(&self, conn: Connection) {
        if self.is_active() {
            self.pools[conn.pool].put(conn.socket);
        } else {
            self.pools[conn.pool].close(conn.socket);
        }
    }

    pub fn close_connection(&self, conn: Connection) {
        self.pools[conn.pool].close(conn.socket);
    }

    /// Takes over a connection whose command timed out mid-response. One
    /// drain attempt is made right away; if the rest of the response has not
    /// arrived yet, the tender keeps trying until the recovery deadline.
    pub fn recover_connection(&self, mut conn: Connection, mut recover: ConnRecover) {
        if conn.socket.set_drain_timeout(Duration::from_millis(1)).is_err() {
            self.abort_recovery(conn);
            return;
        }
        match recover.drain(&mut conn.socket) {
            DrainStatus::Complete => self.complete_recovery(conn),
            DrainStatus::Abort => self.abort_recovery(conn),
            DrainStatus::Pending => self.recovering.lock().push(Recovering { conn, recover }),
        }
    }

    /// Advances every pending recovery. Called once per tend.
    pub(crate) fn process_recovering(&self) {
        let pending: Vec<Recovering> = std::mem::take(&mut *self.recovering.lock());
        if pending.is_empty() {
            return;
        }
        let mut still_pending = Vec::new();
        for mut item in pending {
            match item.recover.drain(&mut item.conn.socket) {
                DrainStatus::Complete => self.complete_recovery(item.conn),
                DrainStatus::Abort => self.abort_recovery(item.conn),
                DrainStatus::Pending => still_pending.push(item),
            }
        }
        self.recovering.lock().extend(still_pending);
    }

    fn complete_recovery(&self, conn: Connection) {
        debug!(node = %self.name, "recovered timed out connection");
        self.conns_recovered.fetch_add(1, Ordering::Relaxed);
        self.put_connection(conn);
    }

    fn abort_recovery(&self, conn: Connection) {
        debug!(node = %self.name, "closing unrecoverable connection");
        self.conns_aborted.fetch_add(1, Ordering::Relaxed);
        self.close_connection(conn);
    }

    pub fn conns_recovered(&self) -> u64 {
        self.conns_recovered.load(Ordering::Relaxed)
    }

    pub fn conns_aborted(&self) -> u64 {
        self.conns_aborted.load(Ordering::Relaxed)
    }

    pub fn recovering_len(&self) -> usize {
        self.recovering.lock().len()
    }

    /// Closes pooled connections idle for longer than the configured limit.
    pub(crate) fn trim_connections(&self) {
        for pool in &self.pools {
            pool.trim(self.connect.max_socket_idle);
        }
    }

    /// Closes everything this node holds. Checked out connections are closed
    /// when they come back.
    pub(crate) fn close(&self) {
        self.deactivate();
        for pool in &self.pools {
            pool.drain();
        }
        for item in std::mem::take(&mut *self.recovering.lock()) {
            self.close_connection(item.conn);
        }
    }

    /// Connections currently accounted to this node, pooled or in use.
    pub fn connection_count(&self) -> u32 {
        self.pools.iter().map(ConnectionPool::total).sum()
    }
}
