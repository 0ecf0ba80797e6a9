//! Cluster node representation

use std::cmp::Ordering;
use std::fmt;

/// A data node in the cluster.
///
/// Immutable after construction. `name` is the canonical `host:port`
/// identity used as the routing and pooling key; `weight` breaks ties
/// when ordering otherwise-identical entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    host: String,
    port: u16,
    name: String,
    weight: u32,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let name = format!("{host}:{port}");
        Self {
            host,
            port,
            name,
            weight: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Parses `"host:port"`. IPv6 hosts keep everything left of the last
    /// colon.
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = addr.rsplit_once(':')?;
        if host.is_empty() {
            return None;
        }
        let port: u16 = port.parse().ok()?;
        Some(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Ord for Server {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then(self.weight.cmp(&other.weight))
    }
}

impl PartialOrd for Server {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let server = Server::parse("10.0.0.1:11210").unwrap();
        assert_eq!(server.host(), "10.0.0.1");
        assert_eq!(server.port(), 11210);
        assert_eq!(server.name(), "10.0.0.1:11210");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(Server::parse("no-port").is_none());
        assert!(Server::parse(":11210").is_none());
        assert!(Server::parse("host:notaport").is_none());
    }

    #[test]
    fn test_ordering_ties_on_weight() {
        let a = Server::new("n1", 11210).with_weight(1);
        let b = Server::new("n1", 11210).with_weight(2);
        assert!(a < b);
    }
}
