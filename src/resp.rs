//! Minimal RESP2 command/value model.
//!
//! The full RESP protocol client, its serializer and its connection pool are
//! explicitly out of scope (spec.md §1) — this module is the thin grounding
//! needed for `connection::TcpSingleNodeClient` to be a real, compiling
//! implementation, trimmed from `rustis::resp::{command, value}` down to the
//! handful of RESP2 types the cluster core actually inspects (bulk strings,
//! arrays, integers, simple strings, errors, nil).

use bytes::Bytes;

/// A command ready to be written to a connection: the command name plus its
/// argument list, each argument an opaque byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Command {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The first argument, i.e. argument index 0 — used by
    /// `command_table::extract_first_key` for commands whose key sits right
    /// after the command name.
    pub fn first_arg(&self) -> Option<&Bytes> {
        self.args.first()
    }

    /// Encodes this command as a RESP2 array of bulk strings.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        buf.extend_from_slice(format!("*{}\r\n", self.args.len() + 1).as_bytes());
        encode_bulk_string(&mut buf, self.name.as_bytes());
        for arg in &self.args {
            encode_bulk_string(&mut buf, arg);
        }
        Bytes::from(buf)
    }
}

fn encode_bulk_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// `cmd("SET").arg("key").arg("value")` — mirrors `rustis::resp::cmd`.
pub fn cmd(name: &'static str) -> Command {
    Command::new(name)
}

/// A decoded RESP2 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn as_error(&self) -> Option<&str> {
        match self {
            Value::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_bulk_string(self) -> Option<Bytes> {
        match self {
            Value::BulkString(b) => b,
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(a) => a,
            _ => None,
        }
    }

    pub fn into_integer(self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }
}
