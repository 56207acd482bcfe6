use std::collections::HashMap;
use std::fmt;

use crate::errors::{Error, ErrorKind, Result};

/// A server response value.
///
/// This is the structured form handed back by the transport; the crate never
/// touches the wire encoding itself.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// A nil response.
    Nil,
    /// The `+OK` status reply.
    Okay,
    /// An integer reply.
    Int(i64),
    /// A binary-safe string reply.
    BulkString(Vec<u8>),
    /// A status-line reply other than `OK`.
    SimpleString(String),
    /// An array of values.
    Array(Vec<Value>),
    /// A map of key-value pairs.
    Map(Vec<(Value, Value)>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Okay => write!(f, "okay"),
            Value::Int(val) => write!(f, "int({val})"),
            Value::BulkString(values) => match std::str::from_utf8(values) {
                Ok(x) => write!(f, "bulk-string('{x:?}')"),
                Err(_) => write!(f, "bulk-string({values:?})"),
            },
            Value::SimpleString(val) => write!(f, "simple-string({val:?})"),
            Value::Array(values) => write!(f, "array({values:?})"),
            Value::Map(values) => write!(f, "map({values:?})"),
        }
    }
}

impl Value {
    /// Interprets the value as an integer count, as returned by `PUBLISH`.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(val) => Ok(*val),
            _ => Err(Error::from((
                ErrorKind::UnexpectedReturnType,
                "expected an integer response",
            ))),
        }
    }

    /// Interprets the value as a list of binary strings.
    pub fn as_bulk_strings(&self) -> Result<Vec<Vec<u8>>> {
        match self {
            Value::Array(values) => values
                .iter()
                .map(|value| match value {
                    Value::BulkString(bytes) => Ok(bytes.clone()),
                    _ => Err(Error::from((
                        ErrorKind::UnexpectedReturnType,
                        "expected an array of bulk strings",
                    ))),
                })
                .collect(),
            _ => Err(Error::from((
                ErrorKind::UnexpectedReturnType,
                "expected an array response",
            ))),
        }
    }
}

/// The kind of a server push message, following the RESP3 push taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PushKind {
    /// A message delivered for an exact channel subscription.
    Message,
    /// A message delivered for a pattern subscription.
    PMessage,
    /// A message delivered for a sharded channel subscription.
    SMessage,
    /// A disconnection notice injected by the transport.
    Disconnection,
}

/// Holds information about received push data.
#[derive(Debug, Clone)]
pub struct PushInfo {
    /// Push kind.
    pub kind: PushKind,
    /// Data from the push message. For `Message`/`SMessage` this is
    /// `[channel, payload]`; for `PMessage` it is `[pattern, channel, payload]`.
    pub data: Vec<Value>,
}

/// A point-in-time snapshot of client counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistics {
    /// Number of physical connections held by the transport.
    pub total_connections: usize,
    /// Number of live client instances in this process.
    pub total_clients: usize,
    /// Number of reconciliation passes that left subscriptions diverged.
    pub subscription_out_of_sync_count: u64,
    /// Wall-clock millis of the last fully-synced reconciliation pass, or 0.
    pub subscription_last_sync_timestamp: u64,
}

impl Statistics {
    /// Renders the snapshot as a string map, the shape wrapper layers expose.
    pub fn as_map(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("total_connections", self.total_connections as u64),
            ("total_clients", self.total_clients as u64),
            (
                "subscription_out_of_sync_count",
                self.subscription_out_of_sync_count,
            ),
            (
                "subscription_last_sync_timestamp",
                self.subscription_last_sync_timestamp,
            ),
        ])
    }
}
