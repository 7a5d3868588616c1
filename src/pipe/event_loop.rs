//! Tokio event loops driving pipelined connections.
//!
//! Each loop is a task that owns its pipe pools outright. Commands and
//! socket events reach it over channels, so pool state is never shared
//! between loops or locked.

use std::{
    collections::VecDeque,
    future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpSocket,
    },
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{recv_buffer_size, send_buffer_size, Checkout, PipePool};
use crate::{
    cluster::{node::Node, Cluster, ClusterInner},
    config::Policy,
    error::{Error, Result, ResultCode},
    net::Deadline,
    wire::{
        info::InfoResponse,
        key::Key,
        proto::{Message, MessageType, ProtoHeader, PROTO_HEADER_SIZE},
    },
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Nodes are told apart by identity: a reseeded node may reuse a name.
type NodeKey = usize;

fn node_key(node: &Arc<Node>) -> NodeKey {
    Arc::as_ptr(node) as usize
}

struct Request {
    node: Arc<Node>,
    frame: Vec<u8>,
    deadline: Option<Instant>,
    reply: oneshot::Sender<Result<Message>>,
}

/// A command waiting on a pipelined connection.
struct Pending {
    reply: oneshot::Sender<Result<Message>>,
    deadline: Option<Instant>,
}

impl Pending {
    fn finish(self, result: Result<Message>) {
        // the caller may have stopped waiting
        let _ = self.reply.send(result);
    }
}

enum IoEvent {
    Response {
        node: NodeKey,
        conn: u64,
        message: Message,
    },
    Failed {
        node: NodeKey,
        conn: u64,
        error: Error,
    },
    /// A connection opened off the loop, carrying the frame of the command
    /// that asked for it.
    Connected {
        node: NodeKey,
        conn: u64,
        frame: Vec<u8>,
        socket: Result<PipeSocket>,
    },
}

struct PipeSocket {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl PipeSocket {
    fn close(self) {
        self.reader.abort();
    }
}

struct NodePipes {
    node: Arc<Node>,
    pool: PipePool<Pending>,
    sockets: HashMap<u64, PipeSocket>,
    /// Connects in progress.
    opening: usize,
    /// Commands queued behind those connects, with their frames.
    waiting: VecDeque<(Pending, Vec<u8>)>,
}

impl NodePipes {
    /// Delivers results and closes whatever the pool released.
    fn settle(&mut self, done: Vec<(Pending, Result<Message>)>) {
        for (pending, result) in done {
            pending.finish(result);
        }
        for id in self.pool.take_released() {
            if let Some(socket) = self.sockets.remove(&id) {
                socket.close();
            }
        }
    }

    fn cancel(&mut self, id: u64, error: Error) {
        let done = self.pool.cancel(id, error.with_in_doubt(true));
        self.settle(done);
    }

    /// Fails queued commands that `fail` selects. They were never sent.
    fn fail_waiting(&mut self, mut fail: impl FnMut(&Pending) -> Option<Error>) {
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for (pending, frame) in self.waiting.drain(..) {
            match fail(&pending) {
                Some(error) => pending.finish(Err(error)),
                None => kept.push_back((pending, frame)),
            }
        }
        self.waiting = kept;
    }
}

#[derive(Clone, Copy)]
struct LoopSettings {
    capacity: u32,
    conn_timeout: Duration,
    send_buffer: u32,
    recv_buffer: u32,
}

struct EventLoop {
    index: usize,
    settings: LoopSettings,
    pools: HashMap<NodeKey, NodePipes>,
    events: mpsc::UnboundedSender<IoEvent>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: mpsc::UnboundedReceiver<IoEvent>,
    ) {
        let mut housekeeping = time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            let next = self.next_deadline();
            let expiry = async move {
                match next {
                    Some(at) => time::sleep_until(at.into()).await,
                    None => future::pending().await,
                }
            };
            select! {
                request = requests.recv() => match request {
                    Some(request) => self.execute(request).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = expiry => self.expire(Instant::now()),
                _ = housekeeping.tick() => self.drop_inactive(),
            }
        }
        self.shutdown();
        debug!(index = self.index, "event loop stopped");
    }

    async fn execute(&mut self, request: Request) {
        let Request {
            node,
            frame,
            deadline,
            reply,
        } = request;
        let pending = Pending { reply, deadline };
        if !node.is_active() {
            pending.finish(Err(Error::new(
                ResultCode::InvalidNode,
                format!("Node {} is not active", node.name()),
            )));
            return;
        }

        let key = node_key(&node);
        let capacity = self.settings.capacity;
        self.pools.entry(key).or_insert_with(|| NodePipes {
            node,
            pool: PipePool::new(capacity),
            sockets: HashMap::new(),
            opening: 0,
            waiting: VecDeque::new(),
        });
        self.dispatch(key, pending, frame).await;
    }

    /// Finds a connection for `pending` and writes its frame. New
    /// connections are opened on a separate task; a command that finds every
    /// connection busy while one is still opening waits for that connect.
    async fn dispatch(&mut self, key: NodeKey, pending: Pending, frame: Vec<u8>) {
        let Some(pipes) = self.pools.get_mut(&key) else {
            pending.finish(Err(Error::client("Pipeline pool missing")));
            return;
        };
        let deadline = pending.deadline;
        let sockets = &pipes.sockets;
        let checkout = pipes.pool.checkout(pending, |id| {
            sockets
                .get(&id)
                .is_some_and(|socket| !socket.reader.is_finished())
        });
        let id = match checkout {
            Ok(Checkout::Pooled(id)) => id,
            Ok(Checkout::New(id)) => {
                pipes.settle(Vec::new());
                pipes.opening += 1;
                let node = pipes.node.clone();
                let limit = Instant::now() + self.settings.conn_timeout;
                let until = deadline.map_or(limit, |at| at.min(limit));
                let settings = self.settings;
                let events = self.events.clone();
                tokio::spawn(async move {
                    let socket = connect(&node, key, id, &settings, until, events.clone()).await;
                    let _ = events.send(IoEvent::Connected {
                        node: key,
                        conn: id,
                        frame,
                        socket,
                    });
                });
                return;
            }
            Err((pending, e)) if e.code == ResultCode::NoMoreConnections && pipes.opening > 0 => {
                trace!(node = pipes.node.name(), "waiting for a pipeline connection to open");
                pipes.waiting.push_back((pending, frame));
                return;
            }
            Err((pending, e)) => {
                pending.finish(Err(e));
                pipes.settle(Vec::new());
                return;
            }
        };
        pipes.settle(Vec::new());
        self.write(key, id, frame).await;
    }

    /// Retries the commands that waited on a connect.
    async fn resume_waiting(&mut self, key: NodeKey) {
        let waiting = match self.pools.get_mut(&key) {
            Some(pipes) => std::mem::take(&mut pipes.waiting),
            None => return,
        };
        for (pending, frame) in waiting {
            self.dispatch(key, pending, frame).await;
        }
    }

    /// Sends the writer's frame on `id`, bounded by the writer's deadline.
    async fn write(&mut self, key: NodeKey, id: u64, frame: Vec<u8>) {
        let Some(pipes) = self.pools.get_mut(&key) else {
            return;
        };
        let deadline = pipes
            .pool
            .get(id)
            .and_then(|conn| conn.writer())
            .and_then(|pending| pending.deadline);
        let Some(socket) = pipes.sockets.get_mut(&id) else {
            pipes.cancel(id, Error::client("Pipeline socket missing"));
            return;
        };
        let written = match deadline {
            Some(at) => time::timeout_at(at.into(), socket.writer.write_all(&frame))
                .await
                .map_err(|_| Error::timeout())
                .and_then(|r| r.map_err(Error::from)),
            None => socket.writer.write_all(&frame).await.map_err(Error::from),
        };
        match written {
            Ok(()) => {
                if let Err(e) = pipes.pool.write_complete(id) {
                    warn!("Pipeline write completion failed: {}", e);
                    pipes.cancel(id, e);
                }
            }
            Err(e) => {
                trace!(conn = id, error = %e, "pipeline write failed");
                pipes.cancel(id, e);
            }
        }
    }

    /// Adopts a freshly opened socket unless its command already gave up.
    async fn connected(&mut self, key: NodeKey, id: u64, frame: Vec<u8>, socket: Result<PipeSocket>) {
        let Some(pipes) = self.pools.get_mut(&key) else {
            if let Ok(socket) = socket {
                socket.close();
            }
            return;
        };
        pipes.opening = pipes.opening.saturating_sub(1);
        let waiting = pipes.pool.get(id).is_some_and(|conn| conn.writer().is_some());
        match socket {
            Ok(socket) if waiting => {
                pipes.sockets.insert(id, socket);
                self.write(key, id, frame).await;
            }
            Ok(socket) => {
                trace!(conn = id, "pipeline command finished before connect");
                socket.close();
            }
            Err(e) => {
                debug!(node = pipes.node.name(), error = %e, "pipeline connect failed");
                if let Some(pending) = pipes.pool.connect_failed(id) {
                    pending.finish(Err(e));
                }
            }
        }
        self.resume_waiting(key).await;
    }

    async fn handle_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Response {
                node,
                conn,
                message,
            } => {
                if let Some(pipes) = self.pools.get_mut(&node) {
                    let done = pipes.pool.response(conn, Ok(message));
                    pipes.settle(done);
                }
            }
            IoEvent::Failed { node, conn, error } => {
                if let Some(pipes) = self.pools.get_mut(&node) {
                    pipes.cancel(conn, error);
                }
            }
            IoEvent::Connected {
                node,
                conn,
                frame,
                socket,
            } => self.connected(node, conn, frame, socket).await,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pools
            .values()
            .flat_map(|pipes| {
                let waiting = pipes.waiting.iter().filter_map(|(p, _)| p.deadline);
                pipes.pool.next_deadline(|p| p.deadline).into_iter().chain(waiting)
            })
            .min()
    }

    /// A timed out command takes its whole connection down: the responses
    /// still queued behind it can't be told apart from its own.
    fn expire(&mut self, now: Instant) {
        for pipes in self.pools.values_mut() {
            for id in pipes.pool.expired(now, |p| p.deadline) {
                trace!(node = pipes.node.name(), conn = id, "pipeline command timed out");
                pipes.cancel(id, Error::timeout());
            }
            pipes.fail_waiting(|p| p.deadline.filter(|&at| at <= now).map(|_| Error::timeout()));
        }
    }

    fn drop_inactive(&mut self) {
        self.pools.retain(|_, pipes| {
            if pipes.node.is_active() {
                return true;
            }
            let name = pipes.node.name().to_owned();
            pipes.fail_waiting(|_| {
                Some(Error::new(
                    ResultCode::InvalidNode,
                    format!("Node {} is not active", name),
                ))
            });
            pipes.pool.close_idle();
            pipes.settle(Vec::new());
            pipes.pool.total() > 0
        });
    }

    fn shutdown(&mut self) {
        for pipes in self.pools.values_mut() {
            let closed = Error::new(ResultCode::ClientAbort, "Event loop closed");
            pipes.fail_waiting(|_| Some(closed.clone()));
            let done = pipes.pool.cancel_all(closed.with_in_doubt(true));
            pipes.settle(done);
            pipes.pool.close_idle();
            pipes.settle(Vec::new());
        }
        self.pools.clear();
    }
}

/// Opens a pipeline socket and starts its reader. Gives up at `until`, the
/// earlier of the command deadline and the connect timeout.
async fn connect(
    node: &Node,
    key: NodeKey,
    id: u64,
    settings: &LoopSettings,
    until: Instant,
    events: mpsc::UnboundedSender<IoEvent>,
) -> Result<PipeSocket> {
    let addr = node.address();
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if settings.send_buffer > 0 {
        socket.set_send_buffer_size(settings.send_buffer)?;
    }
    if settings.recv_buffer > 0 {
        socket.set_recv_buffer_size(settings.recv_buffer)?;
    }
    let stream = time::timeout_at(until.into(), socket.connect(addr))
        .await
        .map_err(|_| Error::timeout())?
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
    // pipelines batch small writes
    stream.set_nodelay(false)?;
    trace!(node = node.name(), conn = id, "opened pipeline connection");

    let (reader, writer) = stream.into_split();
    let span = debug_span!("pipe", node = node.name(), conn = id);
    let reader = tokio::spawn(read_responses(reader, key, id, events).instrument(span));
    Ok(PipeSocket { writer, reader })
}

async fn read_responses(
    mut reader: OwnedReadHalf,
    node: NodeKey,
    conn: u64,
    events: mpsc::UnboundedSender<IoEvent>,
) {
    loop {
        let event = match read_message(&mut reader).await {
            Ok(message) => IoEvent::Response {
                node,
                conn,
                message,
            },
            Err(error) => {
                trace!(error = %error, "pipeline read failed");
                let _ = events.send(IoEvent::Failed { node, conn, error });
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

async fn read_message(reader: &mut OwnedReadHalf) -> Result<Message> {
    let mut header = [0u8; PROTO_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let proto = ProtoHeader::parse(&header);
    match proto.msg_type()? {
        MessageType::Message => {}
        MessageType::Compressed => Err(Error::client("Compressed responses are not supported"))?,
        other => Err(Error::client(format!("Unexpected proto type {:?}", other)))?,
    }
    let mut body = vec![0u8; proto.body_size()?];
    reader.read_exact(&mut body).await?;
    let (message, _) = Message::parse(&body)?;
    Ok(message)
}

struct LoopHandle {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

/// A set of event loops sharing a cluster. Commands are spread over the
/// loops round robin; each loop gets an equal share of the per-node pipeline
/// connection limit.
pub struct EventLoops {
    cluster: Arc<ClusterInner>,
    loops: Vec<LoopHandle>,
    next: AtomicUsize,
}

impl std::fmt::Debug for EventLoops {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoops")
            .field("loops", &self.loops.len())
            .finish()
    }
}

impl EventLoops {
    /// Spawns `config.event_loop_count` loops on the current Tokio runtime.
    pub fn new(cluster: &Cluster) -> Result<Self> {
        let inner = cluster.inner.clone();
        if inner.connect.tls.is_some() {
            Err(Error::new(
                ResultCode::UnsupportedFeature,
                "Pipelined connections do not support TLS",
            ))?
        }
        let count = inner.config.event_loop_count.max(1);
        let capacity = (inner.config.pipe_max_conns_per_node / count as u32).max(1);
        let send_buffer = send_buffer_size();
        let recv_buffer = recv_buffer_size();

        let loops = (0..count)
            .map(|index| {
                let (requests_tx, requests_rx) = mpsc::unbounded_channel();
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let event_loop = EventLoop {
                    index,
                    settings: LoopSettings {
                        capacity,
                        conn_timeout: inner.config.conn_timeout,
                        send_buffer,
                        recv_buffer,
                    },
                    pools: HashMap::new(),
                    events: events_tx,
                };
                let span = debug_span!("event_loop", index);
                let task = tokio::spawn(event_loop.run(requests_rx, events_rx).instrument(span));
                LoopHandle {
                    requests: requests_tx,
                    task,
                }
            })
            .collect();

        Ok(Self {
            cluster: inner,
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Sends one encoded command frame to `node` on the next loop and waits
    /// for its response.
    pub async fn execute_on(&self, node: Arc<Node>, frame: Vec<u8>, deadline: Deadline) -> Result<Message> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len().max(1);
        let handle = self
            .loops
            .get(index)
            .ok_or_else(|| Error::client("Event loops closed"))?;
        let (reply, response) = oneshot::channel();
        let request = Request {
            node,
            frame,
            deadline: deadline.instant(),
            reply,
        };
        if handle.requests.send(request).is_err() {
            Err(Error::new(ResultCode::ClientAbort, "Event loop closed"))?
        }
        response
            .await
            .map_err(|_| Error::new(ResultCode::ClientAbort, "Event loop dropped the command"))?
    }

    /// Pipelined counterpart of [`Executor::execute`], with the same retry
    /// rules.
    ///
    /// [`Executor::execute`]: crate::conn::Executor::execute
    pub async fn execute(&self, key: &Key, frame: Vec<u8>, is_write: bool, policy: &Policy) -> Result<Message> {
        let deadline = Deadline::after(policy.total_timeout);
        let mut attempt = 0;
        let mut sent = false;
        loop {
            let attempt_deadline = deadline.min(Deadline::after(policy.socket_timeout));
            let result = match self.cluster.node_for_key(key, policy.replica, attempt) {
                Ok(node) => self.execute_on(node, frame.clone(), attempt_deadline).await,
                Err(e) => Err(e),
            };
            // server result codes already arrive as errors
            let e = match result {
                Ok(message) => return Ok(message),
                Err(e) => e,
            };
            sent |= e.in_doubt;
            if !e.is_retryable() || attempt >= policy.max_retries || deadline.is_expired() {
                return Err(e.with_in_doubt(is_write && sent));
            }
            attempt += 1;
            debug!(?key, attempt, error = %e, "retrying pipelined command");
            if !policy.sleep_between_retries.is_zero() {
                let pause = match deadline.remaining() {
                    Some(left) => left.min(policy.sleep_between_retries),
                    None => policy.sleep_between_retries,
                };
                time::sleep(pause).await;
            }
        }
    }

    /// Info request to `node` without blocking the runtime.
    pub async fn info(&self, node: Arc<Node>, names: String) -> Result<InfoResponse> {
        let cluster = self.cluster.clone();
        let deadline = Deadline::after(cluster.config.conn_timeout);
        tokio::task::spawn_blocking(move || node.info(&*cluster.transport, &names, deadline))
            .await
            .map_err(|e| Error::client(format!("Info task failed: {}", e)))?
    }

    /// Stops every loop. Commands still in flight fail with `ClientAbort`.
    pub async fn close(self) {
        let tasks: Vec<_> = self
            .loops
            .into_iter()
            .map(|handle| {
                drop(handle.requests);
                handle.task
            })
            .collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("event loop task failed: {}", e);
            }
        }
    }
}
