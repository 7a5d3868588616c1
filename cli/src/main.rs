use std::env;

use synapse::{net::DEFAULT_PORT, query_validate, ClientConfig, Cluster, EventLoops, Host};
use tracing::info;

/// Connects to the cluster behind `hosts` and prints its nodes. With a
/// namespace, also prints each node's cluster-stable key fetched through the
/// event loops.
///
/// Usage: cli <host[:port],...> [namespace]
#[tokio::main]
async fn main() -> synapse::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let hosts = args.next().unwrap_or_else(|| "127.0.0.1:3000".to_owned());
    let namespace = args.next();

    let config = ClientConfig::builder()
        .seeds(Host::parse_hosts(&hosts, DEFAULT_PORT)?)
        .build();
    let cluster = tokio::task::spawn_blocking(move || Cluster::new(config))
        .await
        .map_err(|e| synapse::Error::client(format!("Connect task failed: {}", e)))??;

    info!(partitions = cluster.n_partitions(), "connected");
    for node in cluster.nodes().iter() {
        println!(
            "{} {} features={:#x} partition-generation={}",
            node.name(),
            node.address(),
            node.features(),
            node.partition_generation()
        );
    }

    if let Some(namespace) = namespace {
        let loops = EventLoops::new(&cluster)?;
        for node in cluster.nodes().iter() {
            let key = query_validate::begin_async(&loops, node.clone(), &namespace).await?;
            println!("{} cluster-stable {}={:X}", node.name(), namespace, key);
        }
        loops.close().await;
    }

    cluster.close();
    Ok(())
}
