//! Scanners for the peer lists nodes advertise, plus the per-tend state
//! that collects newly discovered nodes.
//!
//! Parsing is separated from applying: a malformed list is rejected before
//! any node is looked up, so a bad response never registers part of itself.

use std::sync::Arc;

use hashbrown::HashSet;

use super::node::Node;
use crate::{
    error::{Error, Result},
    net::{Host, DEFAULT_PORT},
};

/// One `[name,tls_name,[hosts]]` entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peer {
    pub name: String,
    pub tls_name: Option<String>,
    pub hosts: Vec<Host>,
}

/// A parsed `peers-*` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerList {
    pub generation: u32,
    pub peers: Vec<Peer>,
}

struct Scanner<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.s.as_bytes().get(self.pos).copied()
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() != Some(c) {
            Err(Error::client(format!(
                "Invalid peers. Expected {} at {}",
                c as char,
                self.rest()
            )))?
        }
        self.pos += 1;
        Ok(())
    }

    /// Leading decimal digits; none reads as zero.
    fn number(&mut self) -> u64 {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.s[start..self.pos].parse().unwrap_or(0)
    }

    /// Text up to (not including) the first of `stops`.
    fn until(&mut self, stops: &[u8]) -> Option<&'a str> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                return Some(&self.s[start..self.pos]);
            }
            self.pos += 1;
        }
        None
    }

    fn field(&mut self) -> Result<&'a str> {
        let field = self.until(b",").ok_or_else(|| {
            Error::client(format!("Invalid peers. Expected , at {}", self.rest()))
        })?;
        self.pos += 1;
        Ok(field)
    }

    /// `[ipv6]:port`, `[ipv6]`, `name:port` or a bare name ending at `,`
    /// or `]`.
    fn host(&mut self, tls_name: Option<&str>, default_port: u16) -> Result<Host> {
        let invalid = |rest: &str| Error::client(format!("Invalid peers host: {}", rest));
        let start = self.rest();
        let name = if self.peek() == Some(b'[') {
            self.pos += 1;
            let name = self.until(b"]").ok_or_else(|| invalid(start))?;
            self.pos += 1;
            name
        } else {
            self.until(b":,]").ok_or_else(|| invalid(start))?
        };
        if name.is_empty() {
            return Err(invalid(start));
        }
        let mut port = default_port;
        if self.peek() == Some(b':') {
            self.pos += 1;
            port = self.number() as u16;
        }
        let host = Host::new(name, port);
        Ok(match tls_name {
            Some(tls_name) => host.with_tls_name(tls_name),
            None => host,
        })
    }
}

/// Parses `<generation>,[<default_port>],[[<name>,[<tls_name>],[<host>,...]],...]`.
pub fn parse_peers(s: &str) -> Result<PeerList> {
    let mut sc = Scanner::new(s.trim_end_matches('\n'));
    let generation = sc.number() as u32;
    sc.expect(b',')?;

    let mut default_port = DEFAULT_PORT;
    if sc.peek() != Some(b',') {
        default_port = sc.number() as u16;
        if sc.peek() != Some(b',') {
            sc.expect(b',')?;
        }
    }
    sc.expect(b',')?;
    sc.expect(b'[')?;

    let mut peers = Vec::new();
    if sc.peek() == Some(b']') {
        return Ok(PeerList { generation, peers });
    }
    loop {
        sc.expect(b'[')?;
        let name = sc.field()?.to_owned();
        let tls_name = Some(sc.field()?).filter(|t| !t.is_empty());
        sc.expect(b'[')?;

        let mut hosts = Vec::new();
        loop {
            if sc.peek() == Some(b']') {
                sc.pos += 1;
                break;
            }
            hosts.push(sc.host(tls_name, default_port)?);
            match sc.peek() {
                Some(b',') => sc.pos += 1,
                Some(b']') => {}
                _ => sc.expect(b',')?,
            }
        }
        sc.expect(b']')?;
        peers.push(Peer {
            name,
            tls_name: tls_name.map(str::to_owned),
            hosts,
        });

        if sc.peek() == Some(b']') {
            return Ok(PeerList { generation, peers });
        }
        sc.expect(b',')?;
    }
}

/// Parses the legacy `<host>:<port>;<host>:<port>;...` services list.
/// Entries with a missing or zero port are returned with port 0 so the
/// caller can count and report them.
pub fn parse_services(s: &str) -> Vec<Host> {
    s.trim_end_matches('\n')
        .split(';')
        .filter_map(|entry| entry.rsplit_once(':'))
        .map(|(name, port)| Host::new(name, port.trim().parse().unwrap_or(0)))
        .collect()
}

/// Discoveries of a single tend.
pub struct Peers {
    /// Nodes validated this tend, added to the cluster at its end.
    pub nodes: Vec<Arc<Node>>,
    /// Legacy services hosts already validated this tend.
    pub hosts: HashSet<Host>,
    /// Hosts that failed validation this tend and are not retried.
    pub invalid_hosts: HashSet<Host>,
    /// Every node supports the peers protocol.
    pub use_peers: bool,
    /// Some node reported a new peers generation.
    pub gen_changed: bool,
}

impl Default for Peers {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            hosts: HashSet::new(),
            invalid_hosts: HashSet::new(),
            use_peers: true,
            gen_changed: false,
        }
    }
}

impl Peers {
    pub fn find_local(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|node| node.name() == name)
    }
}
