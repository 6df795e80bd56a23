//! `NodeInfo`/`SlotMap`/`ReplicaMap`/`Topology` (spec.md §3, §4.3).
//!
//! `Topology::load` is grounded on `rustis::network::cluster::Cluster::connect`
//! (which also tries seeds in turn, asks the first reachable one for shard
//! layout, then opens one connection per discovered node) generalized from
//! `CLUSTER SHARDS` to `CLUSTER NODES` parsing, since `spec.md` §4.3 pins the
//! discovery call to `CLUSTER NODES`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use rand::Rng;

use crate::config::{ClusterConfig, Endpoint, ReplicaAffinity};
use crate::connection::SingleNodeClient;
use crate::error::{Error, RedisError, Result};
use crate::node_key::NodeKey;
use crate::resp::{cmd, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

/// One line of `CLUSTER NODES` output, parsed (spec.md §3).
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_key: NodeKey,
    pub role: Role,
    pub primary_id: Option<String>,
    pub slots: Vec<(u16, u16)>,
    pub node_id: String,
}

/// Parses `CLUSTER NODES` output into `NodeInfo`s. Lines for slots under
/// migration (`[slot-<-importing-from <id>]`) are recognized and skipped
/// since this core does not track in-flight resharding state beyond what
/// MOVED/ASK redirection already handles.
pub fn parse_cluster_nodes(output: &str) -> Vec<NodeInfo> {
    let mut nodes = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }

        let node_id = fields[0].to_owned();
        let addr = fields[1].split('@').next().unwrap_or("");
        let node_key = match NodeKey::parse(addr) {
            Ok(nk) => nk,
            Err(_) => continue,
        };

        let flags = fields[2];
        let role = if flags.contains("master") {
            Role::Primary
        } else {
            Role::Replica
        };

        let primary_id = match fields[3] {
            "-" => None,
            id => Some(id.to_owned()),
        };

        let mut slots = Vec::new();
        for token in &fields[8..] {
            if token.starts_with('[') {
                continue;
            }
            match token.split_once('-') {
                Some((start, end)) => {
                    if let (Ok(start), Ok(end)) = (start.parse(), end.parse()) {
                        slots.push((start, end));
                    }
                }
                None => {
                    if let Ok(slot) = token.parse::<u16>() {
                        slots.push((slot, slot));
                    }
                }
            }
        }

        nodes.push(NodeInfo {
            node_key,
            role,
            primary_id,
            slots,
            node_id,
        });
    }

    nodes
}

fn build_slot_map(nodes: &[NodeInfo]) -> HashMap<u16, NodeKey> {
    let mut map = HashMap::new();
    for node in nodes.iter().filter(|n| n.role == Role::Primary) {
        for &(start, end) in &node.slots {
            for slot in start..=end {
                map.insert(slot, node.node_key.clone());
            }
        }
    }
    map
}

fn build_replica_map(nodes: &[NodeInfo]) -> HashMap<NodeKey, Vec<NodeKey>> {
    let mut map: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
    for node in nodes.iter().filter(|n| n.role == Role::Replica) {
        if let Some(primary_id) = &node.primary_id {
            if let Some(primary) = nodes.iter().find(|n| &n.node_id == primary_id) {
                map.entry(primary.node_key.clone()).or_default().push(node.node_key.clone());
            }
        }
    }
    map
}

/// Asynchronously builds a `SingleNodeClient` for a discovered `NodeKey`.
pub type ClientFactory = Arc<
    dyn Fn(NodeKey) -> BoxFuture<'static, Result<Arc<dyn SingleNodeClient>>> + Send + Sync,
>;

/// Lazy per-replica RTT tracking for the `latency` strategy (spec.md §4.3,
/// §9 Open Question — cadence/eviction pinned in SPEC_FULL.md §4).
#[derive(Default)]
struct LatencyTracker {
    last_probe: Mutex<HashMap<NodeKey, Instant>>,
    measured: Mutex<HashMap<NodeKey, Duration>>,
}

impl LatencyTracker {
    async fn maybe_probe(
        &self,
        primary: &NodeKey,
        replicas: &[NodeKey],
        clients: &HashMap<NodeKey, Arc<dyn SingleNodeClient>>,
        interval: Duration,
    ) {
        let now = Instant::now();
        let due = {
            let mut last_probe = self.last_probe.lock().unwrap();
            let due = last_probe
                .get(primary)
                .map(|t| now.duration_since(*t) >= interval)
                .unwrap_or(true);
            if due {
                last_probe.insert(primary.clone(), now);
            }
            due
        };

        if !due {
            return;
        }

        for replica in replicas {
            let Some(client) = clients.get(replica) else { continue };
            let start = Instant::now();
            let ping_ok = client.call(&cmd("PING")).await.is_ok();
            let mut measured = self.measured.lock().unwrap();
            if ping_ok {
                measured.insert(replica.clone(), start.elapsed());
            } else {
                // eviction: an unreachable replica is dropped from
                // consideration until its next successful probe.
                measured.remove(replica);
            }
        }
    }

    fn best(&self, replicas: &[NodeKey]) -> Option<NodeKey> {
        let measured = self.measured.lock().unwrap();
        replicas
            .iter()
            .filter_map(|r| measured.get(r).map(|d| (r, *d)))
            .min_by_key(|(_, d)| *d)
            .map(|(r, _)| r.clone())
    }
}

/// Owns one client per live endpoint, the SlotMap, the ReplicaMap, and the
/// configured replica-selection strategy (spec.md §3).
pub struct Topology {
    clients: HashMap<NodeKey, Arc<dyn SingleNodeClient>>,
    slot_map: RwLock<HashMap<u16, NodeKey>>,
    replica_map: HashMap<NodeKey, Vec<NodeKey>>,
    primaries: Vec<NodeKey>,
    replica_affinity: ReplicaAffinity,
    replica_enabled: bool,
    latency: LatencyTracker,
    latency_probe_interval: Duration,
    closed: AtomicBool,
}

impl Topology {
    /// Discover from the first reachable seed, build the slot/replica maps,
    /// and open one client per discovered node (spec.md §4.3).
    pub async fn load(config: &ClusterConfig, factory: &ClientFactory) -> Result<Topology> {
        let seeds = config.seeds();
        let mut errors = Vec::new();
        let mut discovered = None;

        for seed in &seeds {
            match discover_from_seed(seed, factory, config.slow_command_timeout).await {
                Ok(infos) => {
                    discovered = Some(infos);
                    break;
                }
                Err(e) => errors.push((seed.node_key().to_string(), e.to_string())),
            }
        }

        let mut nodes = discovered.ok_or(Error::InitialSetup(errors))?;

        if let Some(fixed) = &config.fixed_hostname {
            for node in &mut nodes {
                node.node_key = node.node_key.with_host(fixed);
            }
        }

        let slot_map = build_slot_map(&nodes);
        let replica_map = build_replica_map(&nodes);
        let primaries: Vec<NodeKey> = nodes
            .iter()
            .filter(|n| n.role == Role::Primary)
            .map(|n| n.node_key.clone())
            .collect();

        let mut clients = HashMap::with_capacity(nodes.len());
        for node in &nodes {
            let client = factory(node.node_key.clone()).await?;
            clients.insert(node.node_key.clone(), client);
        }

        log::debug!(
            "topology loaded: {} primaries, {} replicas",
            primaries.len(),
            replica_map.values().map(Vec::len).sum::<usize>()
        );

        Ok(Topology {
            clients,
            slot_map: RwLock::new(slot_map),
            replica_map,
            primaries,
            replica_affinity: config.replica_affinity,
            replica_enabled: config.replica_enabled,
            latency: LatencyTracker::default(),
            latency_probe_interval: config.latency_probe_interval,
            closed: AtomicBool::new(false),
        })
    }

    /// `client_for_slot(slot, need_primary)`: primary when `need_primary`,
    /// otherwise delegate to the configured replica-selection strategy
    /// (spec.md §4.3).
    pub async fn client_for_slot(&self, slot: u16, need_primary: bool) -> Result<Arc<dyn SingleNodeClient>> {
        let primary_key = self
            .slot_map
            .read()
            .unwrap()
            .get(&slot)
            .cloned()
            .ok_or(Error::ReloadNeeded)?;

        if need_primary || !self.replica_enabled {
            return self.find_by(&primary_key);
        }

        let replicas = self.replica_map.get(&primary_key).cloned().unwrap_or_default();
        if replicas.is_empty() {
            return self.find_by(&primary_key);
        }

        match self.replica_affinity {
            ReplicaAffinity::Random => {
                let idx = rand::rng().random_range(0..replicas.len());
                self.find_by(&replicas[idx])
            }
            ReplicaAffinity::RandomWithPrimary => {
                let mut candidates = replicas;
                candidates.push(primary_key);
                let idx = rand::rng().random_range(0..candidates.len());
                self.find_by(&candidates[idx])
            }
            ReplicaAffinity::Latency => {
                self.latency
                    .maybe_probe(&primary_key, &replicas, &self.clients, self.latency_probe_interval)
                    .await;
                let chosen = self.latency.best(&replicas).unwrap_or_else(|| {
                    replicas[rand::rng().random_range(0..replicas.len())].clone()
                });
                self.find_by(&chosen)
            }
        }
    }

    pub fn primary_clients(&self) -> Vec<Arc<dyn SingleNodeClient>> {
        self.primaries.iter().filter_map(|k| self.clients.get(k).cloned()).collect()
    }

    pub fn replica_clients(&self) -> Vec<Arc<dyn SingleNodeClient>> {
        self.replica_map
            .values()
            .flatten()
            .filter_map(|k| self.clients.get(k).cloned())
            .collect()
    }

    pub fn all_clients(&self) -> Vec<Arc<dyn SingleNodeClient>> {
        self.clients.values().cloned().collect()
    }

    /// Read-serving set for `AllReplicas` fan-out: replicas of each shard,
    /// falling back to the primary when a shard has none (spec.md §4.4 step 6).
    pub fn read_serving_clients(&self) -> Vec<Arc<dyn SingleNodeClient>> {
        if !self.replica_enabled {
            return self.primary_clients();
        }

        let mut result = Vec::new();
        for primary in &self.primaries {
            let replicas = self.replica_map.get(primary).cloned().unwrap_or_default();
            if replicas.is_empty() {
                if let Some(c) = self.clients.get(primary) {
                    result.push(c.clone());
                }
            } else {
                result.extend(replicas.iter().filter_map(|r| self.clients.get(r).cloned()));
            }
        }
        result
    }

    /// One client per shard, in a stable order, for the scan coordinator
    /// (spec.md §4.6).
    pub fn clients_for_scanning(&self) -> Vec<Arc<dyn SingleNodeClient>> {
        self.primary_clients()
    }

    /// `update_slot(slot, node_key)`: if `node_key` is unknown, signal
    /// `ReloadNeeded` so the caller performs a full refresh (spec.md §4.3).
    pub fn update_slot(&self, slot: u16, node_key: NodeKey) -> Result<()> {
        if !self.clients.contains_key(&node_key) {
            return Err(Error::ReloadNeeded);
        }
        self.slot_map.write().unwrap().insert(slot, node_key);
        Ok(())
    }

    pub fn find_by(&self, node_key: &NodeKey) -> Result<Arc<dyn SingleNodeClient>> {
        self.clients.get(node_key).cloned().ok_or(Error::ReloadNeeded)
    }

    pub fn known_node_key(&self, node_key: &NodeKey) -> bool {
        self.clients.contains_key(node_key)
    }

    /// Arbitrary primary, used when no key can be derived (spec.md §4.3, §8).
    pub fn sample(&self) -> Result<Arc<dyn SingleNodeClient>> {
        self.primaries
            .first()
            .and_then(|k| self.clients.get(k).cloned())
            .ok_or_else(|| Error::Connection("no primaries available".to_owned()))
    }

    pub fn node_keys(&self) -> impl Iterator<Item = &NodeKey> {
        self.clients.keys()
    }

    /// Closes each underlying client exactly once, regardless of how many
    /// times `close` is called or how many prior refreshes occurred
    /// (spec.md §3, §8 testable property).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for client in self.clients.values() {
            client.close().await;
        }
    }
}

async fn discover_from_seed(
    seed: &Endpoint,
    factory: &ClientFactory,
    timeout: Duration,
) -> Result<Vec<NodeInfo>> {
    let client = factory(seed.node_key()).await?;
    let reply = client.call_with_timeout(&cmd("CLUSTER").arg("NODES"), timeout).await;
    client.close().await;

    let reply = reply?;
    match reply {
        Value::BulkString(Some(bytes)) => Ok(parse_cluster_nodes(&String::from_utf8_lossy(&bytes))),
        Value::SimpleString(s) => Ok(parse_cluster_nodes(&s)),
        Value::Error(e) => Err(Error::Command(RedisError::parse(&e))),
        other => Err(Error::Connection(format!("unexpected CLUSTER NODES reply: {other:?}"))),
    }
}
