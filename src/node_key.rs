use std::fmt::{self, Display, Formatter};

use crate::error::{Error, Result};

/// Immutable identity of a cluster endpoint: `host:port`.
///
/// Used across `Topology` as the key into the node-client map, the SlotMap,
/// and the ReplicaMap (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub host: String,
    pub port: u16,
}

impl NodeKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeKey {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` identifier, as it appears in `CLUSTER NODES`
    /// output and in `MOVED`/`ASK` replies.
    pub fn parse(s: &str) -> Result<NodeKey> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidClientConfig(format!("not a host:port pair: {s}")))?;

        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidClientConfig(format!("invalid port in {s}")))?;

        if host.is_empty() {
            return Err(Error::InvalidClientConfig(format!("empty host in {s}")));
        }

        Ok(NodeKey::new(host, port))
    }

    /// Returns a copy with the host replaced, preserving the port — used by
    /// `Topology::load` when `fixed_hostname` is configured (spec.md §4.3).
    pub fn with_host(&self, host: &str) -> NodeKey {
        NodeKey::new(host, self.port)
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let nk = NodeKey::parse("127.0.0.1:7000").unwrap();
        assert_eq!(nk.host, "127.0.0.1");
        assert_eq!(nk.port, 7000);
        assert_eq!(nk.to_string(), "127.0.0.1:7000");
    }

    #[test]
    fn rejects_missing_port() {
        assert!(NodeKey::parse("127.0.0.1").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(NodeKey::parse("127.0.0.1:abc").is_err());
    }

    #[test]
    fn with_host_preserves_port() {
        let nk = NodeKey::new("10.0.0.1", 6380);
        let rewritten = nk.with_host("proxy.internal");
        assert_eq!(rewritten.to_string(), "proxy.internal:6380");
    }

    #[test]
    fn equality_by_both_fields() {
        assert_eq!(NodeKey::new("a", 1), NodeKey::new("a", 1));
        assert_ne!(NodeKey::new("a", 1), NodeKey::new("a", 2));
        assert_ne!(NodeKey::new("a", 1), NodeKey::new("b", 1));
    }
}
