//! Pipelined connections: several requests in flight on one socket, one
//! writer at a time and responses read back in request order.
//!
//! Everything here is owned by exactly one event loop, so none of it is
//! synchronized. The loop performs the socket I/O and feeds the outcomes
//! back in; the state machine decides who gets notified and which
//! connections have to be closed.

use std::{collections::VecDeque, time::Instant};

use hashbrown::HashMap;
use tracing::trace;

use crate::{
    error::{Error, Result, ResultCode},
    wire::proto::Message,
};

pub mod event_loop;

#[cfg(target_os = "linux")]
const WRITE_BUFFER_SIZE: u32 = 5 * 1024 * 1024;
#[cfg(target_os = "linux")]
const READ_BUFFER_SIZE: u32 = 15 * 1024 * 1024;
#[cfg(not(target_os = "linux"))]
const WRITE_BUFFER_SIZE: u32 = 2 * 1024 * 1024;
#[cfg(not(target_os = "linux"))]
const READ_BUFFER_SIZE: u32 = 4 * 1024 * 1024;

/// Send buffer size for pipelined sockets, or 0 to leave the OS default
/// because the kernel limit is lower.
pub fn send_buffer_size() -> u32 {
    buffer_size("/proc/sys/net/core/wmem_max", WRITE_BUFFER_SIZE)
}

/// Receive buffer size for pipelined sockets, or 0 to leave the OS default.
pub fn recv_buffer_size() -> u32 {
    buffer_size("/proc/sys/net/core/rmem_max", READ_BUFFER_SIZE)
}

#[cfg(target_os = "linux")]
fn buffer_size(proc_path: &str, size: u32) -> u32 {
    match std::fs::read_to_string(proc_path) {
        Ok(text) => limit_buffer(proc_path, &text, size),
        Err(_) => {
            tracing::warn!(
                "Failed to read {}; should be at least {}. Please verify.",
                proc_path,
                size
            );
            size
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn buffer_size(_proc_path: &str, size: u32) -> u32 {
    size
}

/// Applies the kernel maximum read from `proc_path`.
fn limit_buffer(proc_path: &str, text: &str, size: u32) -> u32 {
    match text.trim_end_matches('\n').parse::<u32>() {
        Ok(max) if max < size => {
            tracing::debug!(
                "Buffer limit is {}, should be at least {} if async pipelining is used. Please set {} accordingly.",
                max,
                size,
                proc_path
            );
            0
        }
        Ok(_) => size,
        Err(_) => {
            tracing::warn!("Invalid integer value in {}", proc_path);
            size
        }
    }
}

/// Response errors after which the rest of the stream can't be trusted.
pub fn is_fatal(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::QueryAborted
            | ResultCode::ScanAborted
            | ResultCode::AsyncConnection
            | ResultCode::TlsError
            | ResultCode::ClientAbort
            | ResultCode::Client
            | ResultCode::NotAuthenticated
    )
}

/// Writer and reader queue of one pipelined socket.
#[derive(Debug)]
pub struct PipeConnection<C> {
    writer: Option<C>,
    readers: VecDeque<C>,
    in_pool: bool,
    canceled: bool,
}

impl<C> Default for PipeConnection<C> {
    fn default() -> Self {
        Self {
            writer: None,
            readers: VecDeque::new(),
            in_pool: false,
            canceled: false,
        }
    }
}

impl<C> PipeConnection<C> {
    pub fn writer(&self) -> Option<&C> {
        self.writer.as_ref()
    }

    pub fn readers(&self) -> impl Iterator<Item = &C> {
        self.readers.iter()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    pub fn in_pool(&self) -> bool {
        self.in_pool
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// No command is writing to or waiting on the socket.
    pub fn is_idle(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    pub fn write_start(&mut self, cmd: C) -> Result<()> {
        if self.writer.is_some() {
            Err(Error::client("Pipeline connection already has a writer"))?
        }
        self.writer = Some(cmd);
        Ok(())
    }

    /// The writer finished sending and now waits for its response behind
    /// the readers already queued.
    pub fn read_start(&mut self) -> Result<()> {
        let cmd = self
            .writer
            .take()
            .ok_or_else(|| Error::client("Pipeline connection has no writer"))?;
        self.readers.push_back(cmd);
        Ok(())
    }

    /// Hands the head reader its response.
    pub fn response_complete(&mut self) -> Option<C> {
        self.readers.pop_front()
    }

    /// Fails every command on the connection, the writer first. The
    /// connection must not be reused afterwards.
    pub fn cancel(&mut self) -> Vec<C> {
        self.canceled = true;
        let mut cmds = Vec::with_capacity(self.readers.len() + 1);
        cmds.extend(self.writer.take());
        cmds.extend(self.readers.drain(..));
        cmds
    }
}

/// Result of a pool checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checkout {
    /// An existing connection, already validated.
    Pooled(u64),
    /// A slot for a connection the caller must open now.
    New(u64),
}

/// Pipelined connections of one node on one event loop.
///
/// Connections are put back into the pool as soon as their writer has
/// sent, so several commands can wait on the same socket. Connections that
/// are neither pooled nor busy are released; their ids are collected for the
/// loop to close the sockets.
#[derive(Debug)]
pub struct PipePool<C> {
    conns: HashMap<u64, PipeConnection<C>>,
    idle: VecDeque<u64>,
    capacity: u32,
    next_id: u64,
    released: Vec<u64>,
}

impl<C> PipePool<C> {
    pub fn new(capacity: u32) -> Self {
        Self {
            conns: HashMap::new(),
            idle: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 0,
            released: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Connections accounted to this pool, pooled or busy.
    pub fn total(&self) -> usize {
        self.conns.len()
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn get(&self, id: u64) -> Option<&PipeConnection<C>> {
        self.conns.get(&id)
    }

    fn release(&mut self, id: u64) {
        if self.conns.remove(&id).is_some() {
            trace!(conn = id, "closing pipeline connection");
            self.idle.retain(|&idle| idle != id);
            self.released.push(id);
        }
    }

    /// Ids of connections whose sockets must be closed now.
    pub fn take_released(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.released)
    }

    /// Makes `cmd` the writer of a connection. New connections are preferred
    /// while below capacity so that the server handles the load on more
    /// sockets in parallel. At capacity pooled connections are reused;
    /// canceled ones and ones `alive` rejects are released on the way.
    pub fn checkout(&mut self, cmd: C, mut alive: impl FnMut(u64) -> bool) -> Result<Checkout, (C, Error)> {
        if self.conns.len() >= self.capacity as usize {
            while let Some(id) = self.idle.pop_front() {
                let Some(conn) = self.conns.get_mut(&id) else {
                    continue;
                };
                conn.in_pool = false;
                if conn.canceled {
                    trace!(conn = id, "pipeline connection was canceled earlier");
                    self.release(id);
                    continue;
                }
                if !alive(id) {
                    trace!(conn = id, "invalid pipeline socket from pool");
                    if conn.is_idle() {
                        self.release(id);
                    }
                    continue;
                }
                // pooled connections never hold a writer
                conn.writer = Some(cmd);
                return Ok(Checkout::Pooled(id));
            }
        }

        if self.conns.len() < self.capacity as usize {
            let id = self.next_id;
            self.next_id += 1;
            let mut conn = PipeConnection::default();
            conn.writer = Some(cmd);
            self.conns.insert(id, conn);
            return Ok(Checkout::New(id));
        }

        Err((
            cmd,
            Error::new(
                ResultCode::NoMoreConnections,
                format!(
                    "Max node/event loop pipeline connections would be exceeded: {}",
                    self.capacity
                ),
            ),
        ))
    }

    /// The writer of `id` finished sending. The connection goes back to the
    /// pool right away so that the next command can write behind it.
    pub fn write_complete(&mut self, id: u64) -> Result<()> {
        let conn = self
            .conns
            .get_mut(&id)
            .ok_or_else(|| Error::client(format!("Unknown pipeline connection {}", id)))?;
        conn.read_start()?;
        trace!(conn = id, readers = conn.readers.len(), "writer becomes reader");
        if self.idle.len() < self.capacity as usize {
            conn.in_pool = true;
            self.idle.push_back(id);
        }
        Ok(())
    }

    /// Delivers the next response on `id`. A fatal error cancels the whole
    /// connection; anything else only concerns the head reader.
    pub fn response(&mut self, id: u64, result: Result<Message>) -> Vec<(C, Result<Message>)> {
        let result = result.and_then(|msg| match msg.result_code() {
            ResultCode::Ok => Ok(msg),
            code => Err(Error::new(code, code.to_string())),
        });
        if let Err(e) = &result {
            if is_fatal(e.code) {
                return self.cancel(id, e.clone());
            }
        }
        let Some(conn) = self.conns.get_mut(&id) else {
            return Vec::new();
        };
        let Some(cmd) = conn.response_complete() else {
            return Vec::new();
        };
        if conn.is_idle() && !conn.in_pool {
            self.release(id);
        }
        vec![(cmd, result)]
    }

    /// Socket error or timeout on `id`: every command on it fails with `err`.
    /// A pooled connection stays in the pool marked canceled and is released
    /// by the next checkout that pops it.
    pub fn cancel(&mut self, id: u64, err: Error) -> Vec<(C, Result<Message>)> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Vec::new();
        };
        let cmds = conn.cancel();
        trace!(conn = id, canceled = cmds.len(), "canceling pipeline connection");
        if !conn.in_pool {
            self.release(id);
        }
        cmds.into_iter().map(|cmd| (cmd, Err(err.clone()))).collect()
    }

    /// Cancels every connection, including ones still being opened.
    pub fn cancel_all(&mut self, err: Error) -> Vec<(C, Result<Message>)> {
        let ids: Vec<u64> = self.conns.keys().copied().collect();
        ids.into_iter()
            .flat_map(|id| self.cancel(id, err.clone()))
            .collect()
    }

    /// A new connection could not be opened. Only its writer is affected.
    pub fn connect_failed(&mut self, id: u64) -> Option<C> {
        let mut conn = self.conns.remove(&id)?;
        conn.writer.take()
    }

    /// Connections whose writer or head reader passed its deadline.
    pub fn expired(&self, now: Instant, deadline: impl Fn(&C) -> Option<Instant>) -> Vec<u64> {
        self.conns
            .iter()
            .filter(|(_, conn)| {
                conn.writer
                    .iter()
                    .chain(conn.readers.front())
                    .filter_map(&deadline)
                    .any(|at| at <= now)
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Earliest deadline of any writer or head reader.
    pub fn next_deadline(&self, deadline: impl Fn(&C) -> Option<Instant>) -> Option<Instant> {
        self.conns
            .values()
            .flat_map(|conn| conn.writer.iter().chain(conn.readers.front()))
            .filter_map(deadline)
            .min()
    }

    /// Releases idle connections, e.g. once their node left the cluster.
    pub fn close_idle(&mut self) {
        let idle: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_idle())
            .map(|(&id, _)| id)
            .collect();
        for id in idle {
            self.release(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::wire::proto::{MessageBuilder, PROTO_HEADER_SIZE};

    fn message(result_code: u8) -> Message {
        let mut frame = MessageBuilder::new(0, 0, 0, 0).build();
        frame[PROTO_HEADER_SIZE + 5] = result_code;
        Message::parse(&frame[PROTO_HEADER_SIZE..]).unwrap().0
    }

    fn send<C: std::fmt::Debug>(pool: &mut PipePool<C>, cmd: C) -> u64 {
        let id = match pool.checkout(cmd, |_| true).unwrap() {
            Checkout::Pooled(id) | Checkout::New(id) => id,
        };
        pool.write_complete(id).unwrap();
        id
    }

    #[test]
    fn closing_fails_commands_still_connecting() {
        let mut pool = PipePool::new(2);
        let ready = send(&mut pool, "sent");
        // a second command is given a new connection that isn't open yet
        let opening = match pool.checkout("opening", |_| false).unwrap() {
            Checkout::New(id) => id,
            other => panic!("expected a new connection, got {:?}", other),
        };
        assert_ne!(opening, ready);

        let mut failed: Vec<_> = pool
            .cancel_all(Error::new(ResultCode::ClientAbort, "closed"))
            .into_iter()
            .map(|(cmd, result)| {
                assert_eq!(result.unwrap_err().code, ResultCode::ClientAbort);
                cmd
            })
            .collect();
        failed.sort();
        assert_eq!(failed, ["opening", "sent"]);
        assert_eq!(pool.take_released(), [opening]);
        pool.close_idle();
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let mut conn = PipeConnection::default();
        conn.write_start(1).unwrap();
        assert!(conn.write_start(2).is_err());
        conn.read_start().unwrap();
        conn.write_start(2).unwrap();
        assert!(conn.read_start().is_ok());
        assert_eq!(conn.readers().copied().collect::<Vec<_>>(), [1, 2]);
        assert_eq!(conn.response_complete(), Some(1));
    }

    #[test]
    fn socket_error_fails_writer_and_readers_once() {
        let mut pool = PipePool::new(1);
        let id = send(&mut pool, "r1");
        assert_eq!(send(&mut pool, "r2"), id);
        assert_eq!(pool.checkout("w", |_| true).unwrap(), Checkout::Pooled(id));
        let conn = pool.get(id).unwrap();
        assert_eq!(conn.writer(), Some(&"w"));
        assert_eq!(conn.reader_count(), 2);

        let failed = pool.cancel(id, Error::connection("reset"));
        let names: Vec<_> = failed.iter().map(|(cmd, _)| *cmd).collect();
        assert_eq!(names, ["w", "r1", "r2"]);
        assert!(failed.iter().all(|(_, r)| r.is_err()));
        // the writer took it out of the pool, so it is released immediately
        assert_eq!(pool.take_released(), [id]);
        assert_eq!(pool.total(), 0);
        assert!(pool.cancel(id, Error::connection("reset")).is_empty());
    }

    #[test]
    fn canceled_pooled_connections_are_discarded_on_checkout() {
        let mut pool = PipePool::new(1);
        let id = send(&mut pool, "r1");
        let failed = pool.cancel(id, Error::timeout());
        assert_eq!(failed.len(), 1);
        assert!(pool.get(id).unwrap().is_canceled());
        assert!(pool.take_released().is_empty());

        assert_eq!(pool.checkout("next", |_| true).unwrap(), Checkout::New(id + 1));
        assert_eq!(pool.take_released(), [id]);
    }

    #[test]
    fn responses_arrive_in_order_and_idle_busy_connections_close() {
        let mut pool = PipePool::new(2);
        let a = send(&mut pool, "a");
        let b = send(&mut pool, "b");
        assert_ne!(a, b);
        // pool at capacity: reuse
        let c = send(&mut pool, "c");
        assert_eq!(c, a);

        let done = pool.response(a, Ok(message(0)));
        assert_eq!(done[0].0, "a");
        let done = pool.response(a, Ok(message(2)));
        assert_eq!(done[0].0, "c");
        assert_eq!(done[0].1.as_ref().unwrap_err().code, ResultCode::RecordNotFound);
        // non-fatal errors keep the connection
        assert!(pool.get(a).is_some());

        let done = pool.response(b, Ok(message(ResultCode::ScanAborted.code() as u8)));
        assert_eq!(done.len(), 1);
        assert!(pool.get(b).unwrap().is_canceled());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut pool = PipePool::new(1);
        let id = match pool.checkout("a", |_| true).unwrap() {
            Checkout::New(id) => id,
            other => panic!("{:?}", other),
        };
        let (cmd, err) = pool.checkout("b", |_| true).unwrap_err();
        assert_eq!(cmd, "b");
        assert_eq!(err.code, ResultCode::NoMoreConnections);
        assert_eq!(pool.connect_failed(id), Some("a"));
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn deadlines_cover_writer_and_head_reader() {
        let now = Instant::now();
        let mut pool = PipePool::new(1);
        let id = send(&mut pool, 5u64);
        assert_eq!(pool.checkout(50, |_| true).unwrap(), Checkout::Pooled(id));
        let deadline = |ms: &u64| Some(now + Duration::from_millis(*ms));
        assert_eq!(pool.next_deadline(deadline), Some(now + Duration::from_millis(5)));
        assert!(pool.expired(now, deadline).is_empty());
        assert_eq!(pool.expired(now + Duration::from_millis(10), deadline), [id]);
    }

    #[test]
    fn small_kernel_limits_disable_buffer_sizing() {
        assert_eq!(limit_buffer("wmem_max", "212992\n", 5 << 20), 0);
        assert_eq!(limit_buffer("wmem_max", "16777216\n", 5 << 20), 5 << 20);
        assert_eq!(limit_buffer("wmem_max", "junk", 5 << 20), 5 << 20);
    }
}
