use std::{path::PathBuf, sync::Arc, time::Duration};

use typed_builder::TypedBuilder;

use crate::{cluster::partition::Replica, net::Host, txn::Txn};

/// Client-wide configuration. Passed explicitly to [`Cluster::new`] so that no
/// process-wide state is needed.
///
/// [`Cluster::new`]: crate::cluster::Cluster::new
#[derive(TypedBuilder, Clone, Debug)]
pub struct ClientConfig {
    /// Hosts tried in order when the cluster has no live nodes.
    pub seeds: Vec<Host>,
    /// Expected cluster name. Nodes reporting another name are rejected.
    #[builder(default, setter(strip_option, into))]
    pub cluster_name: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tls: Option<TlsConfig>,
    /// Connect and info timeout used by the tender.
    #[builder(default = Duration::from_millis(1000))]
    pub conn_timeout: Duration,
    #[builder(default = Duration::from_millis(1000))]
    pub tend_interval: Duration,
    /// Pooled connections idle for longer are closed instead of reused.
    #[builder(default = Duration::from_secs(55))]
    pub max_socket_idle: Duration,
    /// Sync connection capacity per node, split across the node's pools.
    #[builder(default = 100)]
    pub max_conns_per_node: u32,
    /// Independent sync pools per node. More pools mean less contention on
    /// each pool lock.
    #[builder(default = 1)]
    pub conn_pools_per_node: usize,
    /// Pipelined connection capacity per node, split across event loops.
    #[builder(default = 64)]
    pub pipe_max_conns_per_node: u32,
    #[builder(default = 1)]
    pub event_loop_count: usize,
    /// Use `services-alternate`/`peers-*-alt` addresses.
    #[builder(default = false)]
    pub use_services_alternate: bool,
    #[builder(default = true)]
    pub fail_if_not_connected: bool,
    /// Probe the real service addresses of seeds that may be load balancers.
    #[builder(default = true)]
    pub detect_load_balancer: bool,
    /// Abort socket waits on EINTR instead of retrying.
    #[builder(default = false)]
    pub stop_on_interrupt: bool,
}

impl ClientConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

/// PEM material for TLS connections. Empty configuration uses no client
/// certificate and trusts only the provided roots.
#[derive(TypedBuilder, Clone, Debug, Default)]
pub struct TlsConfig {
    #[builder(default, setter(strip_option, into))]
    pub ca_file: Option<PathBuf>,
    #[builder(default, setter(strip_option))]
    pub ca_pem: Option<Vec<u8>>,
    #[builder(default, setter(strip_option, into))]
    pub cert_file: Option<PathBuf>,
    #[builder(default, setter(strip_option, into))]
    pub key_file: Option<PathBuf>,
}

/// Per command settings.
#[derive(TypedBuilder, Clone, Debug)]
pub struct Policy {
    /// Timeout of a single socket attempt. Zero means no per-attempt limit.
    #[builder(default = Duration::from_millis(30_000))]
    pub socket_timeout: Duration,
    /// Timeout of the whole command including retries. Zero means none.
    #[builder(default = Duration::from_millis(1_000))]
    pub total_timeout: Duration,
    #[builder(default = 2)]
    pub max_retries: u32,
    #[builder(default = Duration::ZERO)]
    pub sleep_between_retries: Duration,
    /// Time allowed to drain a timed out connection before closing it. Zero
    /// disables connection recovery.
    #[builder(default = Duration::ZERO)]
    pub timeout_delay: Duration,
    #[builder(default = Replica::Sequence)]
    pub replica: Replica,
    /// Transaction the command belongs to.
    #[builder(default, setter(strip_option))]
    pub txn: Option<Arc<Txn>>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy::builder().build()
    }
}

impl Policy {
    /// Copy of the timing fields used for transaction monitor operations.
    pub fn monitor_copy(&self) -> Policy {
        Policy {
            socket_timeout: self.socket_timeout,
            total_timeout: self.total_timeout,
            max_retries: self.max_retries,
            sleep_between_retries: self.sleep_between_retries,
            timeout_delay: self.timeout_delay,
            replica: Replica::Master,
            txn: self.txn.clone(),
        }
    }
}

/// Policies used by commit and abort.
#[derive(TypedBuilder, Clone, Debug)]
pub struct TxnPolicy {
    #[builder(default = TxnPolicy::default_verify())]
    pub verify: Policy,
    #[builder(default = TxnPolicy::default_roll())]
    pub roll: Policy,
}

impl TxnPolicy {
    fn default_verify() -> Policy {
        Policy::builder()
            .socket_timeout(Duration::from_millis(3_000))
            .total_timeout(Duration::from_millis(10_000))
            .max_retries(5)
            .sleep_between_retries(Duration::from_millis(1_000))
            .replica(Replica::Master)
            .build()
    }

    fn default_roll() -> Policy {
        Policy::builder()
            .socket_timeout(Duration::from_millis(3_000))
            .total_timeout(Duration::from_millis(10_000))
            .max_retries(5)
            .sleep_between_retries(Duration::from_millis(1_000))
            .replica(Replica::Master)
            .build()
    }
}

impl Default for TxnPolicy {
    fn default() -> Self {
        TxnPolicy::builder().build()
    }
}
