//! `SingleNodeClient`: the external collaborator `spec.md` §1 says is out of
//! scope except where the core consumes it. This module defines the trait
//! the rest of the crate depends on, plus one concrete, real implementation
//! (`TcpSingleNodeClient`) grounded on
//! `rustis::network::standalone_connection::StandaloneConnection` — a single
//! TCP connection per node, no pooling (pooling is out of scope), with the
//! same `native-tls`-backed TLS branch as the teacher's `tcp_tls_connect`.

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::node_key::NodeKey;
use crate::resp::{Command, Value};

/// Either a plain TCP stream or one wrapped in a TLS session, matching
/// whichever `Endpoint`/`NodeOptions` `ssl` asked for (spec.md §3, §6).
enum Stream {
    Plain(TcpStream),
    #[cfg(feature = "tokio-native-tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl Stream {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.write_all(buf).await,
            #[cfg(feature = "tokio-native-tls")]
            Stream::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Plain(s) => s.read(buf).await,
            #[cfg(feature = "tokio-native-tls")]
            Stream::Tls(s) => s.read(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Plain(s) => s.shutdown().await,
            #[cfg(feature = "tokio-native-tls")]
            Stream::Tls(s) => s.shutdown().await,
        }
    }
}

async fn tcp_connect(node_key: &NodeKey, connect_timeout: Duration, ssl: bool) -> Result<Stream> {
    let tcp = timeout(connect_timeout, TcpStream::connect((node_key.host.as_str(), node_key.port)))
        .await
        .map_err(|_| Error::Connection(format!("connect to {node_key} timed out")))?
        .map_err(|e| Error::Connection(format!("connect to {node_key} failed: {e}")))?;
    tcp.set_nodelay(true).ok();

    if !ssl {
        return Ok(Stream::Plain(tcp));
    }

    #[cfg(feature = "tokio-native-tls")]
    {
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| Error::Connection(format!("building TLS connector for {node_key}: {e}")))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = timeout(connect_timeout, connector.connect(&node_key.host, tcp))
            .await
            .map_err(|_| Error::Connection(format!("TLS handshake with {node_key} timed out")))?
            .map_err(|e| Error::Connection(format!("TLS handshake with {node_key} failed: {e}")))?;
        Ok(Stream::Tls(Box::new(tls)))
    }

    #[cfg(not(feature = "tokio-native-tls"))]
    {
        Err(Error::InvalidClientConfig(format!(
            "{node_key} requires TLS (rediss://) but this build was not compiled with the tokio-native-tls feature"
        )))
    }
}

/// Capability the cluster core requires of a single-node Redis connection:
/// synchronous request/response, optional blocking-call with a timeout,
/// connection lifecycle, and error surfacing (spec.md §1).
#[async_trait]
pub trait SingleNodeClient: Send + Sync {
    /// The identity of the node this client is connected to.
    fn node_key(&self) -> &NodeKey;

    /// Send `command` and wait for the reply, using the client's configured
    /// default timeout.
    async fn call(&self, command: &Command) -> Result<Value>;

    /// Like `call`, but applies an explicit per-call timeout
    /// (`Router::blocking_call`, spec.md §4.4).
    async fn call_with_timeout(&self, command: &Command, timeout: Duration) -> Result<Value>;

    fn is_connected(&self) -> bool;

    /// Idempotent: calling `close` more than once must not double-close the
    /// underlying connection (spec.md §3 Topology invariants).
    async fn close(&self);
}

/// A single TCP connection to one cluster node, RESP2 request/response,
/// no pipelining (pipelining is out of scope, spec.md §1).
pub struct TcpSingleNodeClient {
    node_key: NodeKey,
    stream: tokio::sync::Mutex<Option<Stream>>,
    default_timeout: Duration,
}

impl TcpSingleNodeClient {
    pub async fn connect(
        node_key: NodeKey,
        connect_timeout: Duration,
        default_timeout: Duration,
        ssl: bool,
    ) -> Result<Self> {
        let stream = tcp_connect(&node_key, connect_timeout, ssl).await?;

        Ok(TcpSingleNodeClient {
            node_key,
            stream: tokio::sync::Mutex::new(Some(stream)),
            default_timeout,
        })
    }

    async fn send_and_receive(&self, command: &Command, call_timeout: Duration) -> Result<Value> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("{} is closed", self.node_key)))?;

        let encoded = command.encode();
        timeout(call_timeout, stream.write_all(&encoded))
            .await
            .map_err(|_| Error::Connection(format!("write to {} timed out", self.node_key)))??;

        let value = timeout(call_timeout, read_reply(stream))
            .await
            .map_err(|_| Error::Connection(format!("read from {} timed out", self.node_key)))??;

        Ok(value)
    }
}

#[async_trait]
impl SingleNodeClient for TcpSingleNodeClient {
    fn node_key(&self) -> &NodeKey {
        &self.node_key
    }

    async fn call(&self, command: &Command) -> Result<Value> {
        self.send_and_receive(command, self.default_timeout).await
    }

    async fn call_with_timeout(&self, command: &Command, timeout: Duration) -> Result<Value> {
        self.send_and_receive(command, timeout).await
    }

    fn is_connected(&self) -> bool {
        // `try_lock` avoids blocking the caller just to report liveness; a
        // contended mutex still means there is a live connection in use.
        self.stream
            .try_lock()
            .map(|g| g.is_some())
            .unwrap_or(true)
    }

    async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(stream) = guard.take() {
            let mut stream = stream;
            stream.shutdown().await.ok();
        }
    }
}

/// Reads exactly one RESP2 frame off `stream`. Minimal by design: the full
/// frame parser/decoder is out of scope (spec.md §1); this supports the
/// subset of replies the cluster core needs to interpret (errors for
/// MOVED/ASK, bulk strings, integers, arrays, nil).
async fn read_reply(stream: &mut Stream) -> Result<Value> {
    let mut buf = BytesMut::with_capacity(512);
    loop {
        if let Some((value, consumed)) = try_parse(&buf) {
            buf.advance(consumed);
            return Ok(value);
        }

        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Connection("connection closed by peer".to_owned()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn try_parse(buf: &[u8]) -> Option<(Value, usize)> {
    if buf.is_empty() {
        return None;
    }

    let line_end = find_crlf(buf)?;
    let line = std::str::from_utf8(&buf[1..line_end]).ok()?;

    match buf[0] {
        b'+' => Some((Value::SimpleString(line.to_owned()), line_end + 2)),
        b'-' => Some((Value::Error(line.to_owned()), line_end + 2)),
        b':' => Some((Value::Integer(line.parse().ok()?), line_end + 2)),
        b'$' => {
            let len: i64 = line.parse().ok()?;
            if len < 0 {
                return Some((Value::BulkString(None), line_end + 2));
            }
            let len = len as usize;
            let data_start = line_end + 2;
            let data_end = data_start + len;
            if buf.len() < data_end + 2 {
                return None;
            }
            let data = bytes::Bytes::copy_from_slice(&buf[data_start..data_end]);
            Some((Value::BulkString(Some(data)), data_end + 2))
        }
        b'*' => {
            let len: i64 = line.parse().ok()?;
            if len < 0 {
                return Some((Value::Array(None), line_end + 2));
            }
            let mut offset = line_end + 2;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let (value, consumed) = try_parse(&buf[offset..])?;
                items.push(value);
                offset += consumed;
            }
            Some((Value::Array(Some(items)), offset))
        }
        _ => None,
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
