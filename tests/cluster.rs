//! End-to-end coverage of `Router` against fake `SingleNodeClient`s — no
//! real network involved. Each fake client is handed a small handler closure
//! that plays the part of a Redis node for the commands that scenario needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use shardis::{
    cmd, ClientFactory, ClusterConfig, Command, Endpoint, Error, NodeKey, Result, Router,
    SingleNodeClient, Value,
};

type Handler = Box<dyn Fn(&Command) -> Result<Value> + Send + Sync>;

struct FakeClient {
    node_key: NodeKey,
    handler: Handler,
    closed: AtomicU32,
}

impl FakeClient {
    fn new(node_key: NodeKey, handler: Handler) -> Arc<FakeClient> {
        Arc::new(FakeClient {
            node_key,
            handler,
            closed: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl SingleNodeClient for FakeClient {
    fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    async fn call(&self, command: &Command) -> Result<Value> {
        (self.handler)(command)
    }

    async fn call_with_timeout(&self, command: &Command, _timeout: Duration) -> Result<Value> {
        (self.handler)(command)
    }

    fn is_connected(&self) -> bool {
        self.closed.load(Ordering::SeqCst) == 0
    }

    async fn close(&self) {
        self.closed.store(1, Ordering::SeqCst);
    }
}

fn cluster_nodes_reply(text: &'static str) -> Value {
    Value::BulkString(Some(Bytes::from_static(text.as_bytes())))
}

fn factory_from(clients: HashMap<NodeKey, Arc<FakeClient>>) -> ClientFactory {
    let clients = Arc::new(clients);
    Arc::new(
        move |node_key: NodeKey| -> futures_util::future::BoxFuture<'static, Result<Arc<dyn SingleNodeClient>>> {
            let clients = clients.clone();
            Box::pin(async move {
                clients
                    .get(&node_key)
                    .cloned()
                    .map(|c| c as Arc<dyn SingleNodeClient>)
                    .ok_or_else(|| Error::Connection(format!("no fake client for {node_key}")))
            })
        },
    )
}

fn config_for(seeds: &[(&str, u16)]) -> ClusterConfig {
    let endpoints = seeds
        .iter()
        .map(|(host, port)| Endpoint::from_parts(*host, Some(*port), false, None, None, None))
        .collect();
    ClusterConfig::from_endpoints(endpoints)
}

const ONE_PRIMARY_ALL_SLOTS: &str =
    "id1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383\n";

const TWO_PRIMARIES_A_OWNS_ALL: &str = "\
id1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-16383
id2 127.0.0.1:7001@17001 master - 0 0 2 connected
";

const TWO_SHARDS: &str = "\
id1 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-8191
id2 127.0.0.1:7001@17001 master - 0 0 2 connected 8192-16383
";

#[tokio::test]
async fn simple_set_routes_to_the_owning_primary() {
    let node = NodeKey::new("127.0.0.1", 7000);
    let client = FakeClient::new(
        node.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(ONE_PRIMARY_ALL_SLOTS)),
            "set" => Ok(Value::SimpleString("OK".to_owned())),
            other => panic!("unexpected command: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node, client);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let reply = router.call(&cmd("SET").arg("foo").arg("bar")).await.unwrap();
    assert_eq!(reply, Value::SimpleString("OK".to_owned()));
}

#[tokio::test]
async fn moved_reply_is_chased_to_the_new_owner() {
    let node_a = NodeKey::new("127.0.0.1", 7000);
    let node_b = NodeKey::new("127.0.0.1", 7001);

    let slot = shardis::slot_for(b"somekey");

    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(move |command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(TWO_PRIMARIES_A_OWNS_ALL)),
            "get" => Ok(Value::Error(format!("MOVED {slot} 127.0.0.1:7001"))),
            other => panic!("unexpected command on A: {other}"),
        }),
    );
    let client_b = FakeClient::new(
        node_b.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "get" => Ok(Value::BulkString(Some(Bytes::from_static(b"value1")))),
            other => panic!("unexpected command on B: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);
    clients.insert(node_b, client_b);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let reply = router.call(&cmd("GET").arg("somekey")).await.unwrap();
    assert_eq!(reply.into_bulk_string().unwrap().as_ref(), b"value1");
}

#[tokio::test]
async fn ask_reply_redirects_once_without_updating_the_slot_map() {
    let node_a = NodeKey::new("127.0.0.1", 7000);
    let node_b = NodeKey::new("127.0.0.1", 7001);

    let slot = shardis::slot_for(b"migrating");
    let a_calls = Arc::new(AtomicU32::new(0));
    let a_calls_for_handler = a_calls.clone();

    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(move |command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(TWO_PRIMARIES_A_OWNS_ALL)),
            "get" => {
                let call_index = a_calls_for_handler.fetch_add(1, Ordering::SeqCst);
                if call_index == 0 {
                    Ok(Value::Error(format!("ASK {slot} 127.0.0.1:7001")))
                } else {
                    Ok(Value::BulkString(Some(Bytes::from_static(b"hit-a"))))
                }
            }
            other => panic!("unexpected command on A: {other}"),
        }),
    );
    let client_b = FakeClient::new(
        node_b.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "asking" => Ok(Value::SimpleString("OK".to_owned())),
            "get" => Ok(Value::BulkString(Some(Bytes::from_static(b"hit-b-via-ask")))),
            other => panic!("unexpected command on B: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);
    clients.insert(node_b, client_b);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let first = router.call(&cmd("GET").arg("migrating")).await.unwrap();
    assert_eq!(first.into_bulk_string().unwrap().as_ref(), b"hit-b-via-ask");

    // the slot map was not mutated: the same key is routed to A again.
    let second = router.call(&cmd("GET").arg("migrating")).await.unwrap();
    assert_eq!(second.into_bulk_string().unwrap().as_ref(), b"hit-a");
    assert_eq!(a_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cluster_wide_scan_yields_every_key_and_terminates_at_zero() {
    let node_a = NodeKey::new("127.0.0.1", 7000);
    let node_b = NodeKey::new("127.0.0.1", 7001);

    let a_step = Arc::new(AtomicU32::new(0));
    let a_step_for_handler = a_step.clone();
    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(move |command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(TWO_SHARDS)),
            "scan" => {
                let step = a_step_for_handler.fetch_add(1, Ordering::SeqCst);
                let (cursor, keys): (&str, &[&str]) = match step {
                    0 => ("5", &["a1", "a2"]),
                    _ => ("0", &["a3"]),
                };
                Ok(scan_reply(cursor, keys))
            }
            other => panic!("unexpected command on A: {other}"),
        }),
    );
    let client_b = FakeClient::new(
        node_b.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "scan" => Ok(scan_reply("0", &["b1", "b2"])),
            other => panic!("unexpected command on B: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);
    clients.insert(node_b, client_b);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let mut cursor = 0u64;
    let mut seen = Vec::new();
    loop {
        let (next_cursor, items) = router.scan(cursor, &[]).await.unwrap();
        for item in items {
            seen.push(String::from_utf8(item.into_bulk_string().unwrap().to_vec()).unwrap());
        }
        cursor = next_cursor;
        if cursor == 0 {
            break;
        }
    }

    seen.sort();
    assert_eq!(seen, vec!["a1", "a2", "a3", "b1", "b2"]);
}

fn scan_reply(cursor: &str, keys: &[&str]) -> Value {
    Value::Array(Some(vec![
        Value::BulkString(Some(Bytes::from(cursor.to_owned()))),
        Value::Array(Some(
            keys.iter()
                .map(|k| Value::BulkString(Some(Bytes::from(k.to_string()))))
                .collect(),
        )),
    ]))
}

#[tokio::test]
async fn keys_aggregates_sorted_across_primaries() {
    let node_a = NodeKey::new("127.0.0.1", 7000);
    let node_b = NodeKey::new("127.0.0.1", 7001);

    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(TWO_SHARDS)),
            "keys" => Ok(Value::Array(Some(vec![
                Value::BulkString(Some(Bytes::from_static(b"zebra"))),
                Value::BulkString(Some(Bytes::from_static(b"mango"))),
            ]))),
            other => panic!("unexpected command on A: {other}"),
        }),
    );
    let client_b = FakeClient::new(
        node_b.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "keys" => Ok(Value::Array(Some(vec![Value::BulkString(Some(Bytes::from_static(
                b"apple",
            )))]))),
            other => panic!("unexpected command on B: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);
    clients.insert(node_b, client_b);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let reply = router.call(&cmd("KEYS").arg("*")).await.unwrap();
    let keys: Vec<String> = reply
        .into_array()
        .unwrap()
        .into_iter()
        .map(|v| String::from_utf8(v.into_bulk_string().unwrap().to_vec()).unwrap())
        .collect();

    assert_eq!(keys, vec!["apple", "mango", "zebra"]);
}

#[tokio::test]
async fn zero_retry_budget_surfaces_moved_error_unchanged() {
    let node_a = NodeKey::new("127.0.0.1", 7000);
    let slot = shardis::slot_for(b"somekey");

    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(move |command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(ONE_PRIMARY_ALL_SLOTS)),
            "get" => Ok(Value::Error(format!("MOVED {slot} 127.0.0.1:7001"))),
            other => panic!("unexpected command on A: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);

    let router = Router::connect_with_factory(
        config_for(&[("127.0.0.1", 7000)]).with_retry_budget(0),
        factory_from(clients),
    )
    .await
    .unwrap();

    match router.call(&cmd("GET").arg("somekey")).await {
        Err(Error::Command(e)) => assert!(e.to_string().contains("MOVED")),
        other => panic!("expected the MOVED error to surface unchanged, got {other:?}"),
    }
}

#[tokio::test]
async fn connection_error_triggers_refresh_but_does_not_auto_retry() {
    let node_a = NodeKey::new("127.0.0.1", 7000);

    let client_a = FakeClient::new(
        node_a.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(ONE_PRIMARY_ALL_SLOTS)),
            "get" => Err(Error::Connection("reset by peer".to_owned())),
            other => panic!("unexpected command on A: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node_a, client_a);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    let refreshes_before = router.refresh_count();
    match router.call(&cmd("GET").arg("somekey")).await {
        Err(Error::Connection(_)) => {}
        other => panic!("expected the connection error to surface unchanged, got {other:?}"),
    }
    assert_eq!(router.refresh_count(), refreshes_before + 1);
}

#[tokio::test]
async fn orchestration_commands_are_rejected_or_ambiguous() {
    let node = NodeKey::new("127.0.0.1", 7000);
    let client = FakeClient::new(
        node.clone(),
        Box::new(|command| match command.name.to_lowercase().as_str() {
            "cluster" => Ok(cluster_nodes_reply(ONE_PRIMARY_ALL_SLOTS)),
            other => panic!("unexpected command: {other}"),
        }),
    );

    let mut clients = HashMap::new();
    clients.insert(node, client);

    let router = Router::connect_with_factory(config_for(&[("127.0.0.1", 7000)]), factory_from(clients))
        .await
        .unwrap();

    match router.call(&cmd("CLUSTER").arg("FAILOVER")).await {
        Err(Error::OrchestrationCommandNotSupported(_)) => {}
        other => panic!("expected OrchestrationCommandNotSupported, got {other:?}"),
    }

    match router.call(&cmd("MULTI")).await {
        Err(Error::AmbiguousNode(_)) => {}
        other => panic!("expected AmbiguousNode, got {other:?}"),
    }
}
