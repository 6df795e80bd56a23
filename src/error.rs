use std::fmt::{self, Display, Formatter};

/// Library general result type.
pub type Result<T> = std::result::Result<T, Error>;

/// A parsed `MOVED`/`ASK` redirection carried by a server error reply.
#[derive(Debug, Clone, Copy)]
pub struct Redirection {
    pub slot: u16,
}

/// All error kinds surfaced at the public boundary (spec.md §7).
#[derive(Debug)]
pub enum Error {
    /// Malformed seeds, unknown scheme, non-integer db/port.
    InvalidClientConfig(String),
    /// No seed reachable, or every seed returned a parse error.
    InitialSetup(Vec<(String, String)>),
    /// A cluster-orchestration command was rejected outright.
    OrchestrationCommandNotSupported(String),
    /// A transaction verb was used outside of a transactional wrapper.
    AmbiguousNode(String),
    /// A refresh following a connection failure could not re-reach the
    /// originally targeted node.
    NodeMightBeDown(String),
    /// Server-reported error that isn't a recognized MOVED/ASK redirect.
    Command(RedisError),
    /// Connection-level failure, surfaced after a refresh was triggered.
    Connection(String),
    /// A full topology refresh is required before the caller's request can
    /// be satisfied (internal signal, never escapes `Router`).
    ReloadNeeded,
    IO(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidClientConfig(e) => write!(f, "invalid client config: {e}"),
            Error::InitialSetup(causes) => {
                write!(f, "could not discover cluster topology from any seed:")?;
                for (seed, cause) in causes {
                    write!(f, " [{seed}: {cause}]")?;
                }
                Ok(())
            }
            Error::OrchestrationCommandNotSupported(cmd) => {
                write!(f, "cluster orchestration command not supported: {cmd}")
            }
            Error::AmbiguousNode(cmd) => {
                write!(f, "command {cmd} cannot be routed to a single node outside a transaction")
            }
            Error::NodeMightBeDown(node) => write!(f, "node might be down: {node}"),
            Error::Command(e) => write!(f, "command error: {e}"),
            Error::Connection(e) => write!(f, "connection error: {e}"),
            Error::ReloadNeeded => write!(f, "topology reload needed"),
            Error::IO(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IO(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Connection("operation timed out".to_owned())
    }
}

/// Kind of a server-reported error, split out of the raw reply text.
#[derive(Debug, Clone)]
pub enum RedisErrorKind {
    Moved { slot: u16, node_key: crate::node_key::NodeKey },
    Ask { slot: u16, node_key: crate::node_key::NodeKey },
    CrossSlot,
    ClusterDown,
    TryAgain,
    Other(String),
}

/// Error returned by a Redis server, already classified for the recovery
/// loop in `Router::try_send` (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct RedisError {
    pub kind: RedisErrorKind,
    pub message: String,
}

impl RedisError {
    /// Parse a raw RESP error reply (without the leading `-`), recognizing
    /// `MOVED <slot> <node_key>` and `ASK <slot> <node_key>` per spec.md §4.5.
    pub fn parse(message: &str) -> RedisError {
        let mut parts = message.splitn(2, ' ');
        let code = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        let kind = match code {
            "MOVED" => Self::parse_redirect(rest).map(|(slot, node_key)| RedisErrorKind::Moved { slot, node_key }),
            "ASK" => Self::parse_redirect(rest).map(|(slot, node_key)| RedisErrorKind::Ask { slot, node_key }),
            "CROSSSLOT" => Some(RedisErrorKind::CrossSlot),
            "CLUSTERDOWN" => Some(RedisErrorKind::ClusterDown),
            "TRYAGAIN" => Some(RedisErrorKind::TryAgain),
            _ => None,
        }
        .unwrap_or_else(|| RedisErrorKind::Other(message.to_owned()));

        RedisError {
            kind,
            message: message.to_owned(),
        }
    }

    fn parse_redirect(rest: &str) -> Option<(u16, crate::node_key::NodeKey)> {
        let mut it = rest.split_whitespace();
        let slot: u16 = it.next()?.parse().ok()?;
        let addr = it.next()?;
        let node_key = crate::node_key::NodeKey::parse(addr).ok()?;
        Some((slot, node_key))
    }
}

impl Display for RedisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
