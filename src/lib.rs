//! Client core for a partitioned, replicated key/value database.
//!
//! A [`Cluster`] discovers nodes from seed hosts and keeps partition maps
//! current from a background tender thread. Record commands run over pooled
//! blocking sockets through the [`Executor`] trait, or pipelined over tokio
//! event loops with the `async` feature. Multi-record transactions are
//! tracked by [`Txn`] and finished with [`commit`] or [`abort`].

pub mod cluster;
pub mod config;
pub mod conn;
pub mod error;
pub mod net;
#[cfg(feature = "async")]
pub mod pipe;
pub mod query_validate;
pub mod scan;
pub mod txn;
pub mod wire;

pub use cluster::{node::Node, partition::Replica, Cluster};
pub use config::{ClientConfig, Policy, TlsConfig, TxnPolicy};
pub use conn::Executor;
pub use error::{Error, Result, ResultCode};
pub use net::Host;
#[cfg(feature = "async")]
pub use pipe::event_loop::EventLoops;
pub use scan::{PartitionFilter, Scan};
pub use txn::{abort, commit, AbortStatus, CommitStatus, Txn};
pub use wire::{Digest, Key, UserKey};
