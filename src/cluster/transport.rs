use std::{net::SocketAddr, sync::Arc, time::Duration};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::{
    error::Result,
    net::{tls::TlsContext, Deadline, Host, Socket},
    wire::info::{self, InfoResponse, DEFAULT_MAX_RESPONSE},
};

/// How the tender talks to nodes. The cluster only ever needs name/value
/// info requests and host resolution, so tests substitute an in-process
/// fake for the socket implementation.
pub trait InfoTransport: Send + Sync {
    /// Sends `names` (newline separated) to `addr` and returns the parsed
    /// response.
    fn info(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
        names: &str,
        deadline: Deadline,
    ) -> Result<InfoResponse>;

    fn resolve(&self, host: &Host) -> Result<(Vec<SocketAddr>, bool)> {
        host.resolve()
    }

    /// Drops any cached connection to `addr`, called after a failed request.
    fn forget(&self, _addr: SocketAddr) {}
}

/// Socket backed transport keeping one info connection per address, the
/// same way each node keeps a dedicated info socket.
pub struct SocketInfoTransport {
    tls: Option<Arc<TlsContext>>,
    stop_on_interrupt: bool,
    max_response: usize,
    sockets: Mutex<HashMap<SocketAddr, Socket>>,
}

impl SocketInfoTransport {
    pub fn new(tls: Option<Arc<TlsContext>>, stop_on_interrupt: bool) -> Self {
        Self {
            tls,
            stop_on_interrupt,
            max_response: DEFAULT_MAX_RESPONSE,
            sockets: Mutex::new(HashMap::new()),
        }
    }

    fn take_socket(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
        deadline: Deadline,
    ) -> Result<Socket> {
        if let Some(socket) = self.sockets.lock().remove(&addr) {
            if socket.validate(Duration::ZERO) {
                return Ok(socket);
            }
            socket.close();
        }
        let tls = self
            .tls
            .as_deref()
            .map(|ctx| (ctx, tls_name.unwrap_or_default()));
        Socket::connect(addr, tls, deadline, self.stop_on_interrupt)
    }
}

impl InfoTransport for SocketInfoTransport {
    fn info(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
        names: &str,
        deadline: Deadline,
    ) -> Result<InfoResponse> {
        let mut socket = self.take_socket(addr, tls_name, deadline)?;
        // names arrive already newline separated
        match info::request(&mut socket, names, true, deadline, self.max_response) {
            Ok(text) => {
                self.sockets.lock().insert(addr, socket);
                Ok(InfoResponse::parse(&text))
            }
            Err(e) => {
                trace!(%addr, "closing info connection after error");
                socket.close();
                Err(e)
            }
        }
    }

    fn forget(&self, addr: SocketAddr) {
        if let Some(socket) = self.sockets.lock().remove(&addr) {
            socket.close();
        }
    }
}

impl Drop for SocketInfoTransport {
    fn drop(&mut self) {
        for (_, socket) in self.sockets.lock().drain() {
            socket.close();
        }
    }
}
