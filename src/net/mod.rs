use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
};

use crate::error::{Error, ResultCode, Result};

pub mod hex;
pub mod socket;
pub mod tls;

pub use socket::{Deadline, Socket};

/// Port used when a host string or a peers entry omits one.
pub const DEFAULT_PORT: u16 = 3000;

/// Converts an IP address and port to a socket address.
pub(crate) fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

/// A seed or peer host as configured or as advertised by a node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Host {
    pub name: String,
    pub tls_name: Option<String>,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        let tls_name = tls_name.into();
        self.tls_name = if tls_name.is_empty() { None } else { Some(tls_name) };
        self
    }

    /// Parses `host[:tls_name][:port]` entries separated by commas. IPv6
    /// literals must be bracketed.
    pub fn parse_hosts(s: &str, default_port: u16) -> Result<Vec<Host>> {
        let mut hosts = Vec::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            hosts.push(Self::parse_one(entry, default_port)?);
        }
        if hosts.is_empty() {
            return Err(Error::new(ResultCode::InvalidHost, format!("No hosts in '{}'", s)));
        }
        Ok(hosts)
    }

    fn parse_one(entry: &str, default_port: u16) -> Result<Host> {
        let invalid = || Error::new(ResultCode::InvalidHost, format!("Invalid host '{}'", entry));
        let (name, rest) = if let Some(stripped) = entry.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(invalid)?;
            (&stripped[..end], &stripped[end + 1..])
        } else {
            match entry.find(':') {
                Some(i) => (&entry[..i], &entry[i..]),
                None => (entry, ""),
            }
        };
        if name.is_empty() {
            return Err(invalid());
        }
        let parts: Vec<&str> = match rest.strip_prefix(':') {
            Some(rest) => rest.split(':').collect(),
            None if rest.is_empty() => Vec::new(),
            None => return Err(invalid()),
        };
        let mut host = Host::new(name, default_port);
        match parts.as_slice() {
            [] => {}
            [port] => host.port = port.parse().map_err(|_| invalid())?,
            [tls_name, port] => {
                host = host.with_tls_name(*tls_name);
                host.port = port.parse().map_err(|_| invalid())?;
            }
            _ => return Err(invalid()),
        }
        Ok(host)
    }

    /// Resolves the host to socket addresses. The flag reports whether the
    /// name was a DNS alias.
    pub fn resolve(&self) -> Result<(Vec<SocketAddr>, bool)> {
        if let Ok(ip) = self.name.parse::<IpAddr>() {
            return Ok((vec![ip_addr_to_socket_addr(ip, self.port)], false));
        }
        let addrs: Vec<SocketAddr> = (self.name.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::new(
                    ResultCode::InvalidHost,
                    format!("Invalid hostname {}: {}", self.name, e),
                )
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::new(
                ResultCode::InvalidHost,
                format!("Invalid hostname {}: no addresses", self.name),
            ));
        }
        Ok((addrs, true))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_lists() {
        let hosts = Host::parse_hosts("a.example:3100, 10.0.0.1, [::1]:3200, b:tls-b:4333", DEFAULT_PORT)
            .unwrap();
        assert_eq!(hosts[0], Host::new("a.example", 3100));
        assert_eq!(hosts[1], Host::new("10.0.0.1", 3000));
        assert_eq!(hosts[2], Host::new("::1", 3200));
        assert_eq!(hosts[3], Host::new("b", 4333).with_tls_name("tls-b"));
        assert_eq!(hosts[2].to_string(), "[::1]:3200");
    }

    #[test]
    fn rejects_bad_hosts() {
        assert!(Host::parse_hosts("", DEFAULT_PORT).is_err());
        assert!(Host::parse_hosts("a:notaport", DEFAULT_PORT).is_err());
        assert!(Host::parse_hosts("[::1", DEFAULT_PORT).is_err());
    }

    #[test]
    fn literal_addresses_are_not_aliases() {
        let (addrs, alias) = Host::new("127.0.0.1", 3000).resolve().unwrap();
        assert!(!alias);
        assert_eq!(addrs, vec!["127.0.0.1:3000".parse().unwrap()]);
    }
}
