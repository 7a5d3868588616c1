use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    error::{Error, Result, ResultCode},
    net::Socket,
};

/// A socket checked out of a node, tagged with the pool it belongs to.
#[derive(Debug)]
pub struct Connection {
    pub socket: Socket,
    pub pool: usize,
}

/// Bounded set of idle connections for one (node, event loop) pair.
///
/// `total` counts every connection the pool is accountable for, pooled or
/// checked out, and never exceeds `capacity`.
pub struct ConnectionPool {
    idle: Mutex<VecDeque<Socket>>,
    capacity: u32,
    total: AtomicU32,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("total", &self.total())
            .field("idle", &self.idle_len())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity as usize)),
            capacity,
            total: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Reserves a slot for a new connection if the pool is below capacity.
    fn try_reserve(&self) -> bool {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < self.capacity).then_some(total + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| total.checked_sub(1));
    }

    /// Hands out a connection. Below capacity a new one is opened with
    /// `connect`, spreading load over more server side handlers. At capacity
    /// idle connections are reused after a liveness check; dead ones are
    /// closed and skipped. The flag is true for new connections.
    pub fn get(
        &self,
        max_idle: Duration,
        connect: impl FnOnce() -> Result<Socket>,
    ) -> Result<(Socket, bool)> {
        if self.try_reserve() {
            return match connect() {
                Ok(socket) => Ok((socket, true)),
                Err(e) => {
                    self.release_slot();
                    Err(e)
                }
            };
        }
        loop {
            let socket = self.idle.lock().pop_front();
            match socket {
                Some(socket) if socket.validate(max_idle) => return Ok((socket, false)),
                Some(socket) => {
                    trace!("discarding dead pooled connection");
                    socket.close();
                    self.release_slot();
                    // a freed slot may be used for a fresh connection
                    if self.try_reserve() {
                        return match connect() {
                            Ok(socket) => Ok((socket, true)),
                            Err(e) => {
                                self.release_slot();
                                Err(e)
                            }
                        };
                    }
                }
                None => Err(Error::new(
                    ResultCode::NoMoreConnections,
                    format!("Max connections would be exceeded: {}", self.capacity),
                ))?,
            }
        }
    }

    /// Returns a healthy connection for reuse.
    pub fn put(&self, mut socket: Socket) {
        socket.touch();
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity as usize {
            idle.push_front(socket);
        } else {
            drop(idle);
            socket.close();
            self.release_slot();
        }
    }

    /// Closes a checked out connection and frees its slot.
    pub fn close(&self, socket: Socket) {
        socket.close();
        self.release_slot();
    }

    /// Closes idle connections that have outlived `max_idle`, oldest first.
    /// Called by the tender.
    pub fn trim(&self, max_idle: Duration) -> usize {
        let mut closed = 0;
        let mut idle = self.idle.lock();
        while let Some(socket) = idle.back() {
            if !socket.is_idle(max_idle) {
                break;
            }
            if let Some(socket) = idle.pop_back() {
                socket.close();
                self.release_slot();
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "trimmed idle connections");
        }
        closed
    }

    /// Closes every idle connection.
    pub fn drain(&self) {
        let sockets: Vec<Socket> = self.idle.lock().drain(..).collect();
        for socket in sockets {
            socket.close();
            self.release_slot();
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.drain();
    }
}
