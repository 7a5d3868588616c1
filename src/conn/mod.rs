//! Sync connections: pooling, command execution and recovery of
//! connections abandoned mid-response.

pub mod command;
pub mod pool;
pub mod recover;

pub use command::Executor;
pub use pool::{Connection, ConnectionPool};
