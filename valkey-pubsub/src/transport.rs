use std::fmt;
use std::str::FromStr;

use arcstr::ArcStr;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::cmd::Cmd;
use crate::errors::{Error, ErrorKind, Result};
use crate::types::{PushInfo, Value};

/// The address of a single server node.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Node {
    /// DNS hostname or IP of the node.
    pub host: ArcStr,
    /// Port of the node.
    pub port: u16,
}

impl Node {
    /// Creates a node address from host and port.
    pub fn new(host: impl Into<ArcStr>, port: u16) -> Self {
        Node {
            host: host.into(),
            port,
        }
    }

    /// Parses a `host:port` string. Bracketed IPv6 addresses are supported.
    pub fn from_addr(addr: &str) -> Result<Self> {
        let invalid_error = || Error::from((ErrorKind::InvalidArgument, "Invalid node string"));
        addr.rsplit_once(':')
            .and_then(|(host, port)| {
                Some(host.trim_start_matches('[').trim_end_matches(']'))
                    .filter(|host| !host.is_empty())
                    .zip(u16::from_str(port).ok())
                    .map(|(host, port)| Node {
                        host: host.into(),
                        port,
                    })
            })
            .ok_or_else(invalid_error)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The role a node plays in its shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The shard primary.
    Primary,
    /// A read replica.
    Replica,
}

/// Per-node metadata reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node address.
    pub node: Node,
    /// The node's role.
    pub role: Role,
    /// Availability-zone metadata, when the deployment reports it.
    pub zone: Option<ArcStr>,
}

/// A contiguous hash-slot span owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSpan {
    /// First slot of the span, inclusive.
    pub start: u16,
    /// Last slot of the span, inclusive.
    pub end: u16,
    /// The shard primary.
    pub primary: Node,
    /// The shard replicas, possibly empty.
    pub replicas: Vec<Node>,
}

/// A point-in-time snapshot of the cluster shape.
///
/// A standalone deployment is a topology with a single primary and no slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// All known nodes with role and zone metadata.
    pub nodes: Vec<NodeInfo>,
    /// Slot ownership; empty in standalone deployments.
    pub slots: Vec<SlotSpan>,
}

impl Topology {
    /// Returns true if `node` is part of this topology.
    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.iter().any(|info| &info.node == node)
    }

    /// Returns the zone reported for `node`, if any.
    pub fn zone_of(&self, node: &Node) -> Option<&ArcStr> {
        self.nodes
            .iter()
            .find(|info| &info.node == node)
            .and_then(|info| info.zone.as_ref())
    }

    /// Returns all primaries in the topology.
    pub fn primaries(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|info| info.role == Role::Primary)
            .map(|info| &info.node)
    }
}

/// The connection collaborator the client core is built on.
///
/// Implementations own the physical connections, the wire protocol, and
/// reconnect handling. The core only issues structured requests per node and
/// consumes the push stream.
///
/// The acknowledgement contract for batched `SUBSCRIBE`-family commands:
/// `Value::Okay` means every channel in the batch was acknowledged,
/// `Value::Array` of bulk strings names the acknowledged subset, and an error
/// acknowledges nothing.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends a request to a specific node and waits for its response.
    async fn send(&self, node: &Node, cmd: &Cmd) -> Result<Value>;

    /// Returns the current topology snapshot.
    fn topology(&self) -> Topology;

    /// Hands over the stream of server-pushed messages.
    ///
    /// Called once per client; subsequent calls return `None`.
    fn take_push_stream(&self) -> Option<UnboundedReceiver<PushInfo>>;

    /// Number of physical connections currently held.
    fn connection_count(&self) -> usize {
        self.topology().nodes.len()
    }
}
