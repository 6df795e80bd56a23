//! `Router`: the public façade — command dispatch, MOVED/ASK/connection
//! recovery, fan-out aggregation, cluster-wide scan, and refresh
//! (spec.md §3, §4.4, §4.5, §4.6, §4.7).
//!
//! Grounded on `rustis::network::cluster::Cluster::send`'s retry loop
//! (follow MOVED directly, reconnect-and-retry on ASK, trigger a refresh on
//! `CLUSTERDOWN`/connection errors) and on `Cluster::connect`/`reconnect` for
//! the refresh/swap behavior, generalized to the routing-class table in
//! `command_table` instead of the teacher's per-command trait methods.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;

use crate::command_table::{classify, extract_first_key, should_send_to_primary, Aggregation, RoutingClass};
use crate::config::{ClusterConfig, NodeOptions};
use crate::connection::{SingleNodeClient, TcpSingleNodeClient};
use crate::error::{Error, RedisErrorKind, Result};
use crate::node_key::NodeKey;
use crate::resp::{cmd, Command, Value};
use crate::scan::{assert_client_count_fits, ScanCursor};
use crate::slot::slot_for;
use crate::topology::{ClientFactory, Topology};

fn build_factory(options: NodeOptions) -> ClientFactory {
    Arc::new(move |node_key: NodeKey| -> BoxFuture<'static, Result<Arc<dyn SingleNodeClient>>> {
        let options = options.clone();
        Box::pin(async move {
            let client = TcpSingleNodeClient::connect(
                node_key.clone(),
                options.connect_timeout,
                options.command_timeout,
                options.ssl,
            )
            .await?;

            if options.username.is_some() || options.password.is_some() {
                let mut auth = cmd("AUTH");
                if let Some(user) = &options.username {
                    auth = auth.arg(user.clone());
                }
                if let Some(pass) = &options.password {
                    auth = auth.arg(pass.clone());
                }
                client.call(&auth).await?;
            }

            if options.db != 0 {
                client.call(&cmd("SELECT").arg(options.db.to_string())).await?;
            }

            Ok(Arc::new(client) as Arc<dyn SingleNodeClient>)
        })
    })
}

/// Cluster-aware command router: one per application-level client handle
/// (spec.md §3).
pub struct Router {
    config: ClusterConfig,
    factory: ClientFactory,
    topology: RwLock<Arc<Topology>>,
    refresh_count: AtomicU32,
    log_id: u64,
}

impl Router {
    /// Discover the initial topology and build the router (spec.md §4.3,
    /// §8 boundary: surfaces `InitialSetup` if every seed is unreachable).
    pub async fn connect(config: ClusterConfig) -> Result<Router> {
        let factory = build_factory(config.node_options.clone());
        Router::connect_with_factory(config, factory).await
    }

    /// Like `connect`, but with an injectable client factory — the seam
    /// that lets anything implementing `SingleNodeClient` stand in for a
    /// real TCP connection (spec.md §1).
    pub async fn connect_with_factory(config: ClusterConfig, factory: ClientFactory) -> Result<Router> {
        let topology = Topology::load(&config, &factory).await?;
        assert_client_count_fits(topology.clients_for_scanning().len());

        Ok(Router {
            config,
            factory,
            topology: RwLock::new(Arc::new(topology)),
            refresh_count: AtomicU32::new(0),
            log_id: rand::random(),
        })
    }

    /// Concatenation of every connected node's identifier, sorted, so that
    /// two routers pointing at the same cluster compare equal (spec.md §4.4).
    pub async fn id(&self) -> String {
        let topology = self.topology().await;
        let mut keys: Vec<String> = topology.node_keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys.join(",")
    }

    async fn topology(&self) -> Arc<Topology> {
        self.topology.read().await.clone()
    }

    /// `refresh(known_hint?)`: close the current topology, add `known_hint`
    /// to the seed list if given, rediscover, and atomically swap
    /// (spec.md §4.7).
    pub async fn refresh(&self, known_hint: Option<NodeKey>) -> Result<()> {
        if let Some(hint) = known_hint {
            self.config.node_configs.add_node(crate::config::Endpoint::from_parts(
                hint.host,
                Some(hint.port),
                self.config.node_options.ssl,
                self.config.node_options.username.clone(),
                self.config.node_options.password.clone(),
                Some(self.config.node_options.db),
            ));
        }

        let mut guard = self.topology.write().await;
        guard.close().await;

        let fresh = match Topology::load(&self.config, &self.factory).await {
            Ok(fresh) => fresh,
            Err(e) => {
                log::error!("router {}: topology refresh failed: {e}", self.log_id);
                return Err(e);
            }
        };
        assert_client_count_fits(fresh.clients_for_scanning().len());
        *guard = Arc::new(fresh);
        let count = self.refresh_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("router {}: topology refreshed ({count} total)", self.log_id);
        Ok(())
    }

    /// Closes the current topology's connections. Idempotent.
    pub async fn close(&self) {
        self.topology().await.close().await;
    }

    /// True when every client in the current topology reports a live
    /// connection (spec.md §3).
    pub async fn connected(&self) -> bool {
        let topology = self.topology().await;
        topology.all_clients().iter().all(|c| c.is_connected())
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// `call(command)`: classify, route, and run the full redirection/
    /// recovery loop (spec.md §4.4).
    pub async fn call(&self, command: &Command) -> Result<Value> {
        self.call_with_timeout(command, self.config.node_options.command_timeout).await
    }

    /// `call_once(command)`: route exactly like `call`, but a MOVED, ASK or
    /// connection error is surfaced to the caller instead of being chased —
    /// for callers (e.g. a pipeline built on top of this core) that need to
    /// observe a redirection themselves rather than have it absorbed
    /// (spec.md §4.4).
    pub async fn call_once(&self, command: &Command) -> Result<Value> {
        let info = classify(command);
        if info.routing_class == RoutingClass::Rejected {
            return Err(Error::OrchestrationCommandNotSupported(command.name.clone()));
        }
        if info.routing_class == RoutingClass::Ambiguous {
            return Err(Error::AmbiguousNode(command.name.clone()));
        }

        let topology = self.topology().await;
        let need_primary = should_send_to_primary(command, self.config.replica_enabled) || !info.read_only;

        let client = match extract_first_key(command) {
            Some(key) => topology.client_for_slot(slot_for(&key), need_primary).await?,
            None => topology.sample()?,
        };

        let reply = client.call_with_timeout(command, self.config.node_options.command_timeout).await?;
        if let Value::Error(message) = &reply {
            return Err(Error::Command(crate::error::RedisError::parse(message)));
        }
        Ok(reply)
    }

    /// `blocking_call(command, timeout)`: like `call`, with an explicit
    /// per-call timeout forwarded to the single-node client (spec.md §4.4).
    pub async fn blocking_call(&self, command: &Command, timeout: Duration) -> Result<Value> {
        self.call_with_timeout(command, timeout).await
    }

    async fn call_with_timeout(&self, command: &Command, timeout: Duration) -> Result<Value> {
        let info = classify(command);

        match info.routing_class {
            RoutingClass::Rejected => Err(Error::OrchestrationCommandNotSupported(command.name.clone())),
            RoutingClass::Ambiguous => Err(Error::AmbiguousNode(command.name.clone())),

            RoutingClass::Single | RoutingClass::SpecialSubcommand => {
                if info.aggregation == Aggregation::ScanCursor {
                    return Err(Error::AmbiguousNode(
                        "scan must be driven through Router::scan, not Router::call".to_owned(),
                    ));
                }
                self.dispatch_single(command, info.read_only, timeout).await
            }

            RoutingClass::AllNodes => {
                let topology = self.topology().await;
                self.fan_out(&topology.all_clients(), command, timeout, info.aggregation).await
            }
            RoutingClass::AllPrimaries => {
                let topology = self.topology().await;
                self.fan_out(&topology.primary_clients(), command, timeout, info.aggregation).await
            }
            RoutingClass::AllReplicas => {
                let topology = self.topology().await;
                self.fan_out(&topology.read_serving_clients(), command, timeout, info.aggregation).await
            }
        }
    }

    async fn dispatch_single(&self, command: &Command, read_only: bool, timeout: Duration) -> Result<Value> {
        let topology = self.topology().await;
        let need_primary = should_send_to_primary(command, self.config.replica_enabled) || !read_only;

        let client = match extract_first_key(command) {
            Some(key) => {
                let slot = slot_for(&key);
                topology.client_for_slot(slot, need_primary).await?
            }
            None => topology.sample()?,
        };

        self.try_send(topology, client, command.clone(), timeout, 0).await
    }

    /// The MOVED/ASK/connection-error recovery loop (spec.md §4.5).
    #[allow(clippy::only_used_in_recursion)]
    fn try_send<'a>(
        &'a self,
        topology: Arc<Topology>,
        client: Arc<dyn SingleNodeClient>,
        command: Command,
        timeout: Duration,
        attempt: u32,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match client.call_with_timeout(&command, timeout).await {
                Ok(Value::Error(message)) => {
                    let err = crate::error::RedisError::parse(&message);
                    match err.kind {
                        RedisErrorKind::Moved { slot, node_key } => {
                            if attempt >= self.config.retry_budget {
                                return Err(Error::Command(err));
                            }
                            log::debug!("router {}: MOVED {slot} -> {node_key}", self.log_id);
                            let topology = match topology.update_slot(slot, node_key.clone()) {
                                Ok(()) => topology,
                                Err(_) => {
                                    log::warn!(
                                        "router {}: MOVED target {node_key} is unknown, refreshing",
                                        self.log_id
                                    );
                                    self.refresh(Some(node_key.clone())).await?;
                                    self.topology().await
                                }
                            };
                            let next = topology.find_by(&node_key).or_else(|_| topology.sample())?;
                            self.try_send(topology, next, command, timeout, attempt + 1).await
                        }
                        RedisErrorKind::Ask { node_key, .. } => {
                            if attempt >= self.config.retry_budget {
                                return Err(Error::Command(err));
                            }
                            log::trace!("router {}: ASK -> {node_key}", self.log_id);
                            let (topology, next) = match topology.find_by(&node_key) {
                                Ok(next) => (topology, next),
                                Err(_) => {
                                    log::warn!(
                                        "router {}: ASK target {node_key} is unknown, refreshing",
                                        self.log_id
                                    );
                                    self.refresh(Some(node_key.clone())).await?;
                                    let topology = self.topology().await;
                                    let next = topology.find_by(&node_key)?;
                                    (topology, next)
                                }
                            };
                            next.call_with_timeout(&cmd("ASKING"), timeout).await?;
                            self.try_send(topology, next, command, timeout, attempt + 1).await
                        }
                        RedisErrorKind::TryAgain | RedisErrorKind::ClusterDown => {
                            if attempt >= self.config.retry_budget {
                                return Err(Error::Command(err));
                            }
                            log::debug!("router {}: {} on {}, retrying", self.log_id, err.message, client.node_key());
                            self.try_send(topology, client, command, timeout, attempt + 1).await
                        }
                        RedisErrorKind::CrossSlot | RedisErrorKind::Other(_) => Err(Error::Command(err)),
                    }
                }
                Ok(other) => Ok(other),
                // A full refresh is triggered, but the caller's request is
                // re-raised unchanged rather than auto-retried (spec.md §4.5:
                // "do not auto-retry; the caller decides"). If the refreshed
                // topology no longer knows the originally targeted node, that
                // is surfaced as `NodeMightBeDown` per spec.md §7.
                Err(Error::Connection(e)) => {
                    let original_node = client.node_key().clone();
                    log::warn!("router {}: connection error on {original_node}: {e}, refreshing", self.log_id);
                    match self.refresh(Some(original_node.clone())).await {
                        Ok(()) => {
                            if !self.topology().await.known_node_key(&original_node) {
                                return Err(Error::NodeMightBeDown(original_node.to_string()));
                            }
                        }
                        Err(refresh_err) => {
                            log::error!(
                                "router {}: refresh after connection error also failed: {refresh_err}",
                                self.log_id
                            );
                        }
                    }
                    Err(Error::Connection(e))
                }
                Err(other) => Err(other),
            }
        })
    }

    async fn fan_out(
        &self,
        clients: &[Arc<dyn SingleNodeClient>],
        command: &Command,
        timeout: Duration,
        aggregation: Aggregation,
    ) -> Result<Value> {
        if clients.is_empty() {
            return Err(Error::Connection("no clients available for fan-out".to_owned()));
        }

        let max_concurrency = self.config.max_fanout_threads.max(1);
        let mut replies = Vec::with_capacity(clients.len());
        let mut first_error = None;

        // Every client is attempted, batch by batch, before an error is
        // returned — no early cancellation of sibling branches (spec.md §4.4
        // step 4, §7).
        for batch in clients.chunks(max_concurrency) {
            let futures = batch.iter().map(|c| c.call_with_timeout(command, timeout));
            let batch_replies = futures_util::future::join_all(futures).await;
            for (client, reply) in batch.iter().zip(batch_replies) {
                match reply {
                    Ok(v) => replies.push(v),
                    Err(e) => {
                        log::warn!("router {}: fan-out to {} failed: {e}", self.log_id, client.node_key());
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(aggregate(aggregation, replies))
    }

    /// One step of a cluster-wide `SCAN` (spec.md §4.6). Pass `ScanCursor::start().encode()`
    /// to begin; stop once the returned cursor's `is_done` would be true for
    /// the shard count, i.e. the caller sees `0` again after the last shard.
    pub async fn scan(&self, cursor: u64, extra_args: &[bytes::Bytes]) -> Result<(u64, Vec<Value>)> {
        self.scan_with_command("SCAN", cursor, extra_args).await
    }

    pub async fn sscan(&self, key: &[u8], cursor: u64, extra_args: &[bytes::Bytes]) -> Result<(u64, Vec<Value>)> {
        self.single_key_scan("SSCAN", key, cursor, extra_args).await
    }

    pub async fn hscan(&self, key: &[u8], cursor: u64, extra_args: &[bytes::Bytes]) -> Result<(u64, Vec<Value>)> {
        self.single_key_scan("HSCAN", key, cursor, extra_args).await
    }

    pub async fn zscan(&self, key: &[u8], cursor: u64, extra_args: &[bytes::Bytes]) -> Result<(u64, Vec<Value>)> {
        self.single_key_scan("ZSCAN", key, cursor, extra_args).await
    }

    /// `SSCAN`/`HSCAN`/`ZSCAN` are single-key commands: no cluster-wide
    /// cursor packing, just ordinary single-node routing (spec.md §4.4).
    async fn single_key_scan(
        &self,
        name: &'static str,
        key: &[u8],
        cursor: u64,
        extra_args: &[bytes::Bytes],
    ) -> Result<(u64, Vec<Value>)> {
        let command = cmd(name).arg(key.to_vec()).arg(cursor.to_string()).args(extra_args.to_vec());
        let reply = self.call(&command).await?;
        decode_scan_reply(reply)
    }

    async fn scan_with_command(
        &self,
        name: &'static str,
        cursor: u64,
        extra_args: &[bytes::Bytes],
    ) -> Result<(u64, Vec<Value>)> {
        let topology = self.topology().await;
        let clients = topology.clients_for_scanning();
        if clients.is_empty() {
            return Ok((0, Vec::new()));
        }

        let mut state = ScanCursor::decode(cursor);
        loop {
            let client_index = state.client_index as usize;
            if client_index >= clients.len() {
                return Ok((0, Vec::new()));
            }

            let command = cmd(name).arg(state.raw_cursor.to_string()).args(extra_args.to_vec());
            let reply = self.try_send(topology.clone(), clients[client_index].clone(), command, self.config.node_options.command_timeout, 0).await?;
            let (next_raw_cursor, items) = decode_scan_reply(reply)?;

            if next_raw_cursor != 0 {
                let next = ScanCursor { client_index: state.client_index, raw_cursor: next_raw_cursor };
                return Ok((next.encode(), items));
            }

            if client_index + 1 >= clients.len() {
                return Ok((0, items));
            }

            if !items.is_empty() {
                let next = state.advance_to_next_client();
                return Ok((next.encode(), items));
            }

            state = state.advance_to_next_client();
        }
    }
}

fn decode_scan_reply(reply: Value) -> Result<(u64, Vec<Value>)> {
    let mut items = reply
        .into_array()
        .ok_or_else(|| Error::Connection("malformed SCAN reply: not an array".to_owned()))?;
    if items.len() != 2 {
        return Err(Error::Connection("malformed SCAN reply: expected [cursor, items]".to_owned()));
    }
    let values = items.pop().unwrap().into_array().unwrap_or_default();
    let cursor_bytes = items.pop().unwrap().into_bulk_string().unwrap_or_default();
    let cursor: u64 = std::str::from_utf8(&cursor_bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Connection("malformed SCAN reply: non-numeric cursor".to_owned()))?;
    Ok((cursor, values))
}

/// Combines per-node replies according to `aggregation` (spec.md §6).
fn aggregate(aggregation: Aggregation, mut replies: Vec<Value>) -> Value {
    match aggregation {
        Aggregation::None | Aggregation::FirstReply => replies.into_iter().next().unwrap_or(Value::BulkString(None)),

        Aggregation::Sum => {
            let total: i64 = replies.into_iter().filter_map(Value::into_integer).sum();
            Value::Integer(total)
        }

        Aggregation::ConcatAndSort | Aggregation::FlattenUniqueSorted => {
            let mut flat: Vec<Value> = replies.into_iter().flat_map(|v| v.into_array().unwrap_or_default()).collect();
            flat.sort_by(|a, b| value_sort_key(a).cmp(&value_sort_key(b)));
            if aggregation == Aggregation::FlattenUniqueSorted {
                flat.dedup_by(|a, b| value_sort_key(a) == value_sort_key(b));
            }
            Value::Array(Some(flat))
        }

        Aggregation::SortedList => {
            replies.sort_by(|a, b| value_sort_key(a).cmp(&value_sort_key(b)));
            Value::Array(Some(replies))
        }

        Aggregation::Flatten => {
            let flat: Vec<Value> = replies.into_iter().flat_map(|v| v.into_array().unwrap_or_default()).collect();
            Value::Array(Some(flat))
        }

        Aggregation::MergeCountingMaps => {
            // each reply is a flat [member, count, member, count, ...] array;
            // sum counts across nodes for the same member.
            let mut counts: Vec<(Vec<u8>, i64)> = Vec::new();
            for reply in replies {
                let items = reply.into_array().unwrap_or_default();
                let mut it = items.into_iter();
                while let (Some(member), Some(count)) = (it.next(), it.next()) {
                    let Some(member) = member.into_bulk_string() else { continue };
                    let count = count.into_integer().unwrap_or(0);
                    match counts.iter_mut().find(|(m, _)| m == member.as_ref()) {
                        Some((_, c)) => *c += count,
                        None => counts.push((member.to_vec(), count)),
                    }
                }
            }
            let flat = counts
                .into_iter()
                .flat_map(|(m, c)| vec![Value::BulkString(Some(bytes::Bytes::from(m))), Value::Integer(c)])
                .collect();
            Value::Array(Some(flat))
        }

        Aggregation::ListPerNode => Value::Array(Some(replies)),

        Aggregation::ScanCursor => unreachable!("scan is handled by Router::scan, never by generic aggregation"),
    }
}

/// Sort key for `ConcatAndSort`/`FlattenUniqueSorted`/`SortedList` (spec.md
/// §6). Integers (e.g. `lastsave`'s per-node timestamps) sort numerically;
/// strings sort lexicographically by their raw bytes.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortKey {
    Int(i64),
    Bytes(Vec<u8>),
}

fn value_sort_key(value: &Value) -> SortKey {
    match value {
        Value::BulkString(Some(b)) => SortKey::Bytes(b.to_vec()),
        Value::SimpleString(s) => SortKey::Bytes(s.clone().into_bytes()),
        Value::Integer(i) => SortKey::Int(*i),
        _ => SortKey::Bytes(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sum_adds_integers() {
        let result = aggregate(Aggregation::Sum, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
        assert_eq!(result, Value::Integer(6));
    }

    #[test]
    fn aggregate_concat_and_sort_flattens_and_sorts() {
        let a = Value::Array(Some(vec![Value::BulkString(Some(bytes::Bytes::from_static(b"b")))]));
        let b = Value::Array(Some(vec![Value::BulkString(Some(bytes::Bytes::from_static(b"a")))]));
        let result = aggregate(Aggregation::ConcatAndSort, vec![a, b]);
        let items = result.into_array().unwrap();
        assert_eq!(items[0].clone().into_bulk_string().unwrap().as_ref(), b"a");
        assert_eq!(items[1].clone().into_bulk_string().unwrap().as_ref(), b"b");
    }

    #[test]
    fn aggregate_merge_counting_maps_sums_per_member() {
        let a = Value::Array(Some(vec![
            Value::BulkString(Some(bytes::Bytes::from_static(b"chan"))),
            Value::Integer(1),
        ]));
        let b = Value::Array(Some(vec![
            Value::BulkString(Some(bytes::Bytes::from_static(b"chan"))),
            Value::Integer(2),
        ]));
        let result = aggregate(Aggregation::MergeCountingMaps, vec![a, b]);
        let items = result.into_array().unwrap();
        assert_eq!(items[1].clone().into_integer().unwrap(), 3);
    }

    #[test]
    fn aggregate_sorted_list_orders_integers_numerically() {
        let result = aggregate(
            Aggregation::SortedList,
            vec![Value::Integer(20), Value::Integer(3), Value::Integer(100)],
        );
        let items = result.into_array().unwrap();
        let values: Vec<i64> = items.into_iter().map(|v| v.into_integer().unwrap()).collect();
        assert_eq!(values, vec![3, 20, 100]);
    }

    #[test]
    fn decode_scan_reply_rejects_non_array() {
        assert!(decode_scan_reply(Value::Integer(1)).is_err());
    }

    #[test]
    fn decode_scan_reply_parses_cursor_and_items() {
        let reply = Value::Array(Some(vec![
            Value::BulkString(Some(bytes::Bytes::from_static(b"42"))),
            Value::Array(Some(vec![Value::BulkString(Some(bytes::Bytes::from_static(b"k1")))])),
        ]));
        let (cursor, items) = decode_scan_reply(reply).unwrap();
        assert_eq!(cursor, 42);
        assert_eq!(items.len(), 1);
    }
}
