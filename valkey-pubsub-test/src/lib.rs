//! Testing support
//!
//! This crate provides [`MockBroker`], an in-memory pub/sub broker whose
//! connections implement the `valkey_pubsub::Transport` trait. It can be used
//! anywhere a real transport is expected, which makes it possible to test
//! subscription reconciliation, message delivery, and command routing without
//! a server.
//!
//! # Example
//!
//! ```rust
//! use valkey_pubsub::{ChannelKind, Client, ClientConfig};
//! use valkey_pubsub_test::MockBroker;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> valkey_pubsub::Result<()> {
//! let broker = MockBroker::standalone();
//! let client = Client::new(broker.connect(), ClientConfig::default())?;
//! client
//!     .subscribe_blocking(["news"], ChannelKind::Exact, 1000)
//!     .await?;
//! broker.publish(b"news", b"hello");
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use async_trait::async_trait;
use valkey_pubsub::{
    Cmd, Error, ErrorKind, Node, NodeInfo, PushInfo, PushKind, Result, Role, SlotSpan, Topology,
    Transport, Value,
};

const LOCK_ERR: &str = "mock broker lock poisoned";
const SLOT_COUNT: u32 = 16384;

/// An in-memory broker shared by any number of mock connections.
///
/// Each [`MockBroker::connect`] call produces a transport with its own push
/// stream and its own server-side subscription registry, mirroring how a real
/// deployment tracks subscriptions per connection.
pub struct MockBroker {
    topology: Topology,
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    connections: Vec<Weak<ConnectionState>>,
    deny_subscriptions: bool,
    failed_nodes: HashSet<Node>,
}

struct ConnectionState {
    subscriptions: Mutex<HashMap<SubKind, HashSet<Vec<u8>>>>,
    push_sender: UnboundedSender<PushInfo>,
    push_receiver: Mutex<Option<UnboundedReceiver<PushInfo>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SubKind {
    Exact,
    Pattern,
    Sharded,
}

/// A single mock connection; implements [`Transport`].
pub struct MockTransport {
    broker: Arc<MockBroker>,
    state: Arc<ConnectionState>,
}

impl MockBroker {
    /// A broker fronting a single standalone primary.
    pub fn standalone() -> Arc<Self> {
        let topology = Topology {
            nodes: vec![NodeInfo {
                node: Node::new("localhost", 6379),
                role: Role::Primary,
                zone: None,
            }],
            slots: vec![],
        };
        Self::with_topology(topology)
    }

    /// A broker fronting a cluster of `shards` shards with
    /// `replicas_per_shard` replicas each, slots divided evenly.
    ///
    /// Nodes are named `shard<i>-primary` and `shard<i>-replica<j>`, all on
    /// port 6379.
    pub fn cluster(shards: u16, replicas_per_shard: u16) -> Arc<Self> {
        assert!(shards > 0, "a cluster needs at least one shard");
        let mut nodes = Vec::new();
        let mut slots = Vec::new();
        let span = SLOT_COUNT / shards as u32;
        for shard in 0..shards {
            let primary = Node::new(format!("shard{shard}-primary"), 6379);
            nodes.push(NodeInfo {
                node: primary.clone(),
                role: Role::Primary,
                zone: None,
            });
            let replicas: Vec<Node> = (0..replicas_per_shard)
                .map(|replica| Node::new(format!("shard{shard}-replica{replica}"), 6379))
                .collect();
            for replica in &replicas {
                nodes.push(NodeInfo {
                    node: replica.clone(),
                    role: Role::Replica,
                    zone: None,
                });
            }
            let start = shard as u32 * span;
            let end = if shard + 1 == shards {
                SLOT_COUNT - 1
            } else {
                (shard as u32 + 1) * span - 1
            };
            slots.push(SlotSpan {
                start: start as u16,
                end: end as u16,
                primary,
                replicas,
            });
        }
        Self::with_topology(Topology { nodes, slots })
    }

    /// A broker over an arbitrary topology.
    pub fn with_topology(topology: Topology) -> Arc<Self> {
        Arc::new(Self {
            topology,
            state: Mutex::new(BrokerState::default()),
        })
    }

    /// Opens a new connection to the broker.
    pub fn connect(self: &Arc<Self>) -> Arc<MockTransport> {
        let (push_sender, push_receiver) = unbounded_channel();
        let state = Arc::new(ConnectionState {
            subscriptions: Mutex::new(HashMap::new()),
            push_sender,
            push_receiver: Mutex::new(Some(push_receiver)),
        });
        self.state
            .lock()
            .expect(LOCK_ERR)
            .connections
            .push(Arc::downgrade(&state));
        Arc::new(MockTransport {
            broker: Arc::clone(self),
            state,
        })
    }

    /// When set, `SUBSCRIBE`-family commands fail with a `NOPERM` server
    /// error, simulating an ACL that blocks pub/sub. Unsubscribes still work.
    pub fn deny_subscriptions(&self, deny: bool) {
        self.state.lock().expect(LOCK_ERR).deny_subscriptions = deny;
    }

    /// Makes every request to `node` fail with a connection error until
    /// [`MockBroker::restore_node`] is called.
    pub fn fail_node(&self, node: &Node) {
        self.state
            .lock()
            .expect(LOCK_ERR)
            .failed_nodes
            .insert(node.clone());
    }

    /// Clears a failure injected by [`MockBroker::fail_node`].
    pub fn restore_node(&self, node: &Node) {
        self.state.lock().expect(LOCK_ERR).failed_nodes.remove(node);
    }

    /// Publishes directly through the broker, bypassing any client. Returns
    /// the number of deliveries, counting pattern matches separately.
    pub fn publish(&self, channel: &[u8], payload: &[u8]) -> i64 {
        self.fan_out(channel, payload, false)
    }

    /// Publishes a sharded message directly through the broker.
    pub fn spublish(&self, channel: &[u8], payload: &[u8]) -> i64 {
        self.fan_out(channel, payload, true)
    }

    fn fan_out(&self, channel: &[u8], payload: &[u8], sharded: bool) -> i64 {
        let connections: Vec<Arc<ConnectionState>> = {
            let mut state = self.state.lock().expect(LOCK_ERR);
            state.connections.retain(|conn| conn.strong_count() > 0);
            state
                .connections
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        };

        let mut receivers = 0;
        for connection in connections {
            let subscriptions = connection.subscriptions.lock().expect(LOCK_ERR);
            if sharded {
                if subscriptions
                    .get(&SubKind::Sharded)
                    .is_some_and(|set| set.contains(channel))
                {
                    let _ = connection.push_sender.send(PushInfo {
                        kind: PushKind::SMessage,
                        data: vec![
                            Value::BulkString(channel.to_vec()),
                            Value::BulkString(payload.to_vec()),
                        ],
                    });
                    receivers += 1;
                }
                continue;
            }
            if subscriptions
                .get(&SubKind::Exact)
                .is_some_and(|set| set.contains(channel))
            {
                let _ = connection.push_sender.send(PushInfo {
                    kind: PushKind::Message,
                    data: vec![
                        Value::BulkString(channel.to_vec()),
                        Value::BulkString(payload.to_vec()),
                    ],
                });
                receivers += 1;
            }
            if let Some(patterns) = subscriptions.get(&SubKind::Pattern) {
                for pattern in patterns {
                    if glob_match(pattern, channel) {
                        let _ = connection.push_sender.send(PushInfo {
                            kind: PushKind::PMessage,
                            data: vec![
                                Value::BulkString(pattern.clone()),
                                Value::BulkString(channel.to_vec()),
                                Value::BulkString(payload.to_vec()),
                            ],
                        });
                        receivers += 1;
                    }
                }
            }
        }
        receivers
    }
}

impl MockTransport {
    fn handle(&self, node: &Node, cmd: &Cmd) -> Result<Value> {
        {
            let broker = self.broker.state.lock().expect(LOCK_ERR);
            if broker.failed_nodes.contains(node) {
                return Err(Error::from((
                    ErrorKind::Connection,
                    "Injected node failure",
                    node.to_string(),
                )));
            }
        }
        if !self.broker.topology.contains(node) {
            return Err(Error::from((
                ErrorKind::Connection,
                "Unknown node",
                node.to_string(),
            )));
        }

        let name = cmd
            .command()
            .ok_or_else(|| Error::from((ErrorKind::InvalidArgument, "Empty command")))?;
        match name.as_slice() {
            b"SUBSCRIBE" => self.subscribe(SubKind::Exact, cmd),
            b"PSUBSCRIBE" => self.subscribe(SubKind::Pattern, cmd),
            b"SSUBSCRIBE" => self.subscribe(SubKind::Sharded, cmd),
            b"UNSUBSCRIBE" => self.unsubscribe(SubKind::Exact, cmd),
            b"PUNSUBSCRIBE" => self.unsubscribe(SubKind::Pattern, cmd),
            b"SUNSUBSCRIBE" => self.unsubscribe(SubKind::Sharded, cmd),
            b"PUBLISH" => self.publish_cmd(cmd, false),
            b"SPUBLISH" => self.publish_cmd(cmd, true),
            b"PING" => Ok(match cmd.arg_idx(1) {
                Some(message) => Value::BulkString(message.to_vec()),
                None => Value::SimpleString("PONG".into()),
            }),
            b"ECHO" => Ok(Value::BulkString(
                cmd.arg_idx(1).unwrap_or_default().to_vec(),
            )),
            _ => {
                log::debug!("mock broker ignoring {cmd:?}");
                Ok(Value::Nil)
            }
        }
    }

    fn subscribe(&self, kind: SubKind, cmd: &Cmd) -> Result<Value> {
        if self.broker.state.lock().expect(LOCK_ERR).deny_subscriptions {
            return Err(Error::from_server_message(
                "NOPERM this user has no permissions to access one of the channels",
            ));
        }
        let mut subscriptions = self.state.subscriptions.lock().expect(LOCK_ERR);
        let set = subscriptions.entry(kind).or_default();
        for channel in channel_args(cmd) {
            set.insert(channel);
        }
        Ok(Value::Okay)
    }

    fn unsubscribe(&self, kind: SubKind, cmd: &Cmd) -> Result<Value> {
        let mut subscriptions = self.state.subscriptions.lock().expect(LOCK_ERR);
        if let Some(set) = subscriptions.get_mut(&kind) {
            for channel in channel_args(cmd) {
                set.remove(&channel);
            }
            if set.is_empty() {
                subscriptions.remove(&kind);
            }
        }
        Ok(Value::Okay)
    }

    fn publish_cmd(&self, cmd: &Cmd, sharded: bool) -> Result<Value> {
        let (Some(channel), Some(payload)) = (cmd.arg_idx(1), cmd.arg_idx(2)) else {
            return Err(Error::from((
                ErrorKind::InvalidArgument,
                "PUBLISH requires a channel and a payload",
            )));
        };
        Ok(Value::Int(self.broker.fan_out(channel, payload, sharded)))
    }

    /// The connection's server-side subscription registry, as a snapshot.
    /// Useful for asserting what reconciliation actually sent.
    pub fn registered_channels(&self, pattern: bool) -> HashSet<Vec<u8>> {
        let kind = if pattern {
            SubKind::Pattern
        } else {
            SubKind::Exact
        };
        self.state
            .subscriptions
            .lock()
            .expect(LOCK_ERR)
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, node: &Node, cmd: &Cmd) -> Result<Value> {
        self.handle(node, cmd)
    }

    fn topology(&self) -> Topology {
        self.broker.topology.clone()
    }

    fn take_push_stream(&self) -> Option<UnboundedReceiver<PushInfo>> {
        self.state.push_receiver.lock().expect(LOCK_ERR).take()
    }

    fn connection_count(&self) -> usize {
        self.broker.topology.nodes.len()
    }
}

fn channel_args(cmd: &Cmd) -> Vec<Vec<u8>> {
    cmd.args_iter().skip(1).map(|arg| arg.to_vec()).collect()
}

/// Glob matching over channel names: `*`, `?`, and `[...]` classes.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => (0..=text.len()).any(|skip| glob_match(&pattern[1..], &text[skip..])),
        Some(b'?') => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        Some(b'[') => {
            let Some(close) = pattern.iter().position(|b| *b == b']') else {
                return text.first() == Some(&b'[') && glob_match(&pattern[1..], &text[1..]);
            };
            let Some(first) = text.first() else {
                return false;
            };
            let class = &pattern[1..close];
            let (negated, class) = match class.split_first() {
                Some((b'^', rest)) => (true, rest),
                _ => (false, class),
            };
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == b'-' {
                    if (class[i]..=class[i + 2]).contains(first) {
                        hit = true;
                    }
                    i += 3;
                } else {
                    if class[i] == *first {
                        hit = true;
                    }
                    i += 1;
                }
            }
            hit != negated && glob_match(&pattern[close + 1..], &text[1..])
        }
        Some(byte) => text.first() == Some(byte) && glob_match(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valkey_pubsub::cmd;

    #[tokio::test]
    async fn subscribe_registers_and_publish_delivers() {
        let broker = MockBroker::standalone();
        let transport = broker.connect();
        let mut pushes = transport.take_push_stream().unwrap();
        let node = Node::new("localhost", 6379);

        let mut request = cmd("SUBSCRIBE");
        request.arg("news");
        assert_eq!(transport.send(&node, &request).await.unwrap(), Value::Okay);
        assert!(transport.registered_channels(false).contains(&b"news".to_vec()));

        assert_eq!(broker.publish(b"news", b"hello"), 1);
        assert_eq!(broker.publish(b"other", b"hello"), 0);
        let push = pushes.recv().await.unwrap();
        assert_eq!(push.kind, PushKind::Message);
    }

    #[tokio::test]
    async fn pattern_subscription_counts_separately() {
        let broker = MockBroker::standalone();
        let transport = broker.connect();
        let node = Node::new("localhost", 6379);

        let mut exact = cmd("SUBSCRIBE");
        exact.arg("news.tech");
        transport.send(&node, &exact).await.unwrap();
        let mut pattern = cmd("PSUBSCRIBE");
        pattern.arg("news.*");
        transport.send(&node, &pattern).await.unwrap();

        // One connection subscribed both ways receives two deliveries.
        assert_eq!(broker.publish(b"news.tech", b"x"), 2);
    }

    #[tokio::test]
    async fn denied_subscriptions_return_a_server_error() {
        let broker = MockBroker::standalone();
        broker.deny_subscriptions(true);
        let transport = broker.connect();
        let node = Node::new("localhost", 6379);

        let mut request = cmd("SUBSCRIBE");
        request.arg("blocked");
        let err = transport.send(&node, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCommand);

        // Unsubscribes are unaffected by the denial.
        let mut request = cmd("UNSUBSCRIBE");
        request.arg("blocked");
        assert!(transport.send(&node, &request).await.is_ok());
    }

    #[tokio::test]
    async fn failed_node_rejects_requests_until_restored() {
        let broker = MockBroker::cluster(3, 1);
        let transport = broker.connect();
        let node = Node::new("shard0-primary", 6379);

        broker.fail_node(&node);
        let err = transport.send(&node, &cmd("PING")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        broker.restore_node(&node);
        assert!(transport.send(&node, &cmd("PING")).await.is_ok());
    }

    #[test]
    fn cluster_topology_covers_every_slot() {
        let broker = MockBroker::cluster(3, 2);
        assert_eq!(broker.topology.nodes.len(), 9);
        assert_eq!(broker.topology.slots.first().unwrap().start, 0);
        assert_eq!(broker.topology.slots.last().unwrap().end, 16383);
        let covered: u32 = broker
            .topology
            .slots
            .iter()
            .map(|span| span.end as u32 - span.start as u32 + 1)
            .sum();
        assert_eq!(covered, 16384);
    }
}
