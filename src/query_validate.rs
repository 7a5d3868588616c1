//! Migration detection for scans and queries.
//!
//! A node answers `cluster-stable` with a hex cluster key that changes
//! whenever partition ownership moves. The key is fetched before a scan or
//! query starts on a node and compared again while and after it runs.

use std::time::Duration;

use tracing::debug;

use crate::{
    cluster::{node::Node, Cluster},
    error::{Error, Result},
    net::Deadline,
    wire::info::InfoResponse,
};

fn command(namespace: &str) -> String {
    format!("cluster-stable:namespace={}\n", namespace)
}

/// Cluster key in a `cluster-stable` response. Zero is not a valid key.
pub fn parse_cluster_key(response: &InfoResponse) -> Result<u64> {
    let value = response.iter().next().map(|(_, value)| value).unwrap_or("");
    match u64::from_str_radix(value.trim(), 16) {
        Ok(key) if key != 0 => Ok(key),
        _ => Err(Error::client(format!(
            "Failed to parse cluster-stable results: {}",
            value
        ))),
    }
}

/// Compares a fresh key with the one taken at the start. A zero `expected`
/// means validation was not requested.
pub fn check(expected: u64, actual: u64) -> Result<()> {
    if expected != 0 && expected != actual {
        debug!(expected, actual, "cluster key changed");
        Err(Error::cluster_change(format!(
            "Cluster is in migration: {}, {}",
            expected, actual
        )))?
    }
    Ok(())
}

fn cluster_key(cluster: &Cluster, node: &Node, namespace: &str, timeout: Duration) -> Result<u64> {
    let response = node.info(
        &*cluster.inner.transport,
        &command(namespace),
        Deadline::after(timeout),
    )?;
    parse_cluster_key(&response)
}

/// Fetches the key to validate against later.
pub fn begin(cluster: &Cluster, node: &Node, namespace: &str, timeout: Duration) -> Result<u64> {
    cluster_key(cluster, node, namespace, timeout)
}

/// Fails with `ClusterChange` when the key moved since [`begin`]. Used
/// between pages and once the scan or query ends.
pub fn validate(
    cluster: &Cluster,
    node: &Node,
    namespace: &str,
    expected: u64,
    timeout: Duration,
) -> Result<()> {
    if expected == 0 {
        return Ok(());
    }
    let actual = cluster_key(cluster, node, namespace, timeout)?;
    check(expected, actual)
}

#[cfg(feature = "async")]
mod pipelined {
    use std::sync::Arc;

    use super::*;
    use crate::pipe::event_loop::EventLoops;

    async fn cluster_key_async(loops: &EventLoops, node: Arc<Node>, namespace: &str) -> Result<u64> {
        let response = loops.info(node, command(namespace)).await?;
        parse_cluster_key(&response)
    }

    /// Async [`begin`], run on the event loops before the first command.
    pub async fn begin_async(loops: &EventLoops, node: Arc<Node>, namespace: &str) -> Result<u64> {
        cluster_key_async(loops, node, namespace).await
    }

    /// Async check between commands on a node.
    pub async fn next_async(loops: &EventLoops, node: Arc<Node>, namespace: &str, expected: u64) -> Result<()> {
        if expected == 0 {
            return Ok(());
        }
        let actual = cluster_key_async(loops, node, namespace).await?;
        check(expected, actual)
    }

    /// Async check after the last command on a node.
    pub async fn end_async(loops: &EventLoops, node: Arc<Node>, namespace: &str, expected: u64) -> Result<()> {
        next_async(loops, node, namespace, expected).await
    }
}

#[cfg(feature = "async")]
pub use pipelined::{begin_async, end_async, next_async};
