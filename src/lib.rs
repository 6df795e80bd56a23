//! Routing core for a Redis Cluster client: topology discovery from
//! `CLUSTER NODES`, slot-based command dispatch, `MOVED`/`ASK` redirection
//! handling, fan-out aggregation for cluster-wide commands, and a
//! cluster-wide `SCAN` coordinator.
//!
//! This crate does not speak RESP to an application; it routes already-built
//! [`Command`]s to the right node(s) and decodes just enough of the reply to
//! recognize a redirection. Pairing it with a full RESP client is left to the
//! caller — see [`SingleNodeClient`] for the seam.
//!
//! ```no_run
//! use shardis::{ClusterConfig, Router};
//!
//! # async fn example() -> shardis::Result<()> {
//! let config = ClusterConfig::from_urls(&["redis://127.0.0.1:7000"])?;
//! let router = Router::connect(config).await?;
//! router.call(&shardis::cmd("PING")).await?;
//! # Ok(())
//! # }
//! ```

mod command_table;
mod connection;
mod config;
mod error;
mod node_key;
mod resp;
mod router;
mod scan;
mod slot;
mod topology;

pub use command_table::{Aggregation, CommandInfo, RoutingClass};
pub use config::{ClusterConfig, Endpoint, EndpointFields, NodeOptions, ReplicaAffinity};
pub use connection::{SingleNodeClient, TcpSingleNodeClient};
pub use error::{Error, RedisError, RedisErrorKind, Result};
pub use node_key::NodeKey;
pub use resp::{cmd, Command, Value};
pub use router::Router;
pub use scan::{ScanCursor, MAX_SCANNING_CLIENTS};
pub use slot::{slot_for, SLOT_COUNT};
pub use topology::{ClientFactory, NodeInfo, Role, Topology};
