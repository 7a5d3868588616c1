//! Synchronous single-record command execution.

use std::thread;

use tracing::{debug, trace};

use super::{
    pool::Connection,
    recover::{ConnRecover, Interrupted, ReadState},
};
use crate::{
    cluster::{node::Node, Cluster, ClusterInner},
    config::Policy,
    error::{Error, Result, ResultCode},
    net::Deadline,
    wire::{
        key::Key,
        proto::{Message, MessageType, ProtoHeader, PROTO_HEADER_SIZE},
    },
};

/// Runs an encoded record command against the node owning `key`.
///
/// Responses with a non-zero result code are returned as errors carrying
/// that code. `is_write` marks commands whose failure after sending leaves
/// the record state in doubt.
pub trait Executor: Send + Sync {
    fn execute(&self, key: &Key, request: &[u8], is_write: bool, policy: &Policy) -> Result<Message>;
}

impl Executor for Cluster {
    fn execute(&self, key: &Key, request: &[u8], is_write: bool, policy: &Policy) -> Result<Message> {
        execute(&self.inner, key, request, is_write, policy)
    }
}

/// Sends `request` with retries. The node is chosen anew on each attempt so
/// that `Replica::Sequence` moves to the prole after a failure.
pub(crate) fn execute(
    cluster: &ClusterInner,
    key: &Key,
    request: &[u8],
    is_write: bool,
    policy: &Policy,
) -> Result<Message> {
    let deadline = Deadline::after(policy.total_timeout);
    let mut attempt = 0;
    let mut sent = false;
    loop {
        let result = cluster
            .node_for_key(key, policy.replica, attempt)
            .and_then(|node| run_once(&node, request, policy, deadline, &mut sent));
        let e = match result {
            Ok(msg) => return check_result(msg),
            Err(e) => e,
        };
        if !e.is_retryable() || attempt >= policy.max_retries || deadline.is_expired() {
            return Err(e.with_in_doubt(is_write && sent));
        }
        attempt += 1;
        debug!(?key, attempt, error = %e, "retrying command");
        if !policy.sleep_between_retries.is_zero() {
            let pause = match deadline.remaining() {
                Some(left) => left.min(policy.sleep_between_retries),
                None => policy.sleep_between_retries,
            };
            thread::sleep(pause);
        }
    }
}

fn check_result(msg: Message) -> Result<Message> {
    match msg.result_code() {
        ResultCode::Ok => Ok(msg),
        code => Err(Error::new(code, code.to_string())),
    }
}

/// One attempt on one connection. On success the connection goes back to
/// the pool. A timeout mid-response hands the connection to recovery when
/// the policy allows it; every other failure closes it.
pub(crate) fn run_once(
    node: &Node,
    request: &[u8],
    policy: &Policy,
    deadline: Deadline,
    sent: &mut bool,
) -> Result<Message> {
    let mut conn = node.get_connection(deadline)?;
    if let Err(e) = conn.socket.write_all(request, policy.socket_timeout, deadline) {
        node.close_connection(conn);
        return Err(e);
    }
    *sent = true;

    let mut header = [0u8; PROTO_HEADER_SIZE];
    let mut pos = 0;
    if let Err(e) = conn
        .socket
        .read_tracked(&mut header, &mut pos, policy.socket_timeout, deadline)
    {
        abandon(
            node,
            conn,
            &e,
            Interrupted::at_header(ReadState::Proto, &header[..pos]),
            policy,
        );
        return Err(e);
    }

    let proto = ProtoHeader::parse(&header);
    let size = match (proto.msg_type(), proto.body_size()) {
        (Ok(MessageType::Message), Ok(size)) => size,
        (Ok(MessageType::Compressed), _) => {
            node.close_connection(conn);
            return Err(Error::client("Compressed responses are not supported"));
        }
        (Err(e), _) | (_, Err(e)) => {
            node.close_connection(conn);
            return Err(e);
        }
        (Ok(other), _) => {
            node.close_connection(conn);
            return Err(Error::client(format!("Unexpected proto type {:?}", other)));
        }
    };

    let mut body = vec![0u8; size];
    let mut pos = 0;
    if let Err(e) = conn
        .socket
        .read_tracked(&mut body, &mut pos, policy.socket_timeout, deadline)
    {
        abandon(node, conn, &e, Interrupted::in_detail(size - pos, false), policy);
        return Err(e);
    }

    match Message::parse(&body) {
        Ok((msg, _)) => {
            node.put_connection(conn);
            Ok(msg)
        }
        Err(e) => {
            node.close_connection(conn);
            Err(e)
        }
    }
}

fn abandon(node: &Node, conn: Connection, e: &Error, interrupted: Interrupted, policy: &Policy) {
    if e.is_timeout() && !policy.timeout_delay.is_zero() {
        trace!(node = node.name(), state = ?interrupted.state, "recovering timed out connection");
        node.recover_connection(conn, ConnRecover::new(interrupted, true, policy.timeout_delay));
    } else {
        node.close_connection(conn);
    }
}
