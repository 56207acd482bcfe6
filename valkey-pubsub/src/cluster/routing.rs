use rand::seq::IteratorRandom;

use crate::cluster::slot_map::{ShardAddrs, SlotMap, SLOT_SIZE};
use crate::cmd::Cmd;
use crate::errors::{Error, ErrorKind, Result};
use crate::transport::{Node, Topology};

fn slot(key: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(key) % SLOT_SIZE
}

/// Returns the slot that matches `key`, honoring `{hashtag}` grouping.
pub fn get_slot(key: &[u8]) -> u16 {
    let key = match get_hashtag(key) {
        Some(tag) => tag,
        None => key,
    };

    slot(key)
}

fn get_hashtag(key: &[u8]) -> Option<&[u8]> {
    let open = key.iter().position(|v| *v == b'{')?;
    let close = key[open..].iter().position(|v| *v == b'}')?;
    let rv = &key[open + 1..open + close];
    (!rv.is_empty()).then_some(rv)
}

/// Whether a slot-addressed route targets the shard primary or a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAddr {
    /// The shard primary.
    Primary,
    /// A shard replica. Routing fails if the shard has none.
    Replica,
}

/// A logical route for a cluster-aware command.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Route {
    /// Fan out to every node in the cluster.
    AllNodes,
    /// Fan out to every shard primary.
    AllPrimaries,
    /// Route to one node picked at random at dispatch time.
    Random,
    /// Route to the shard owning the slot of the given key.
    SlotKey(SlotAddr, Vec<u8>),
    /// Route to the shard owning the given slot id.
    SlotId(SlotAddr, u16),
    /// Route to the node with this exact address. Rejected if the address is
    /// not part of the known topology.
    ByAddress(String, u16),
}

impl Route {
    /// Returns true if this route fans out to more than one node.
    pub fn is_multi_node(&self) -> bool {
        matches!(self, Route::AllNodes | Route::AllPrimaries)
    }
}

/// A read-preference policy applied when a route may be served by replicas.
///
/// This is deliberately not a [`Route`] variant: it shapes how slot routes
/// resolve, it does not select nodes by itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadFrom {
    /// Always read from the shard primary.
    #[default]
    Primary,
    /// Spread reads across replicas, falling back to the primary.
    PreferReplica,
    /// Prefer replicas in the given availability zone; fall back to the
    /// regular replica distribution when none matches.
    AzAffinity(String),
    /// Prefer replicas and the primary in the given availability zone; same
    /// fallback as [`ReadFrom::AzAffinity`].
    AzAffinityReplicasAndPrimary(String),
}

/// Commands that may be served by a replica.
pub(crate) fn is_readonly_cmd(cmd: &Cmd) -> bool {
    matches!(
        cmd.command().as_deref(),
        Some(
            b"GET"
                | b"MGET"
                | b"EXISTS"
                | b"STRLEN"
                | b"TTL"
                | b"PTTL"
                | b"TYPE"
                | b"LLEN"
                | b"LRANGE"
                | b"SCARD"
                | b"SMEMBERS"
                | b"SISMEMBER"
                | b"HGET"
                | b"HGETALL"
                | b"HLEN"
                | b"ZCARD"
                | b"ZSCORE"
                | b"ZRANGE"
                | b"PING"
                | b"ECHO"
                | b"PUBSUB"
        )
    )
}

/// The concrete node set a route resolved to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedRoute {
    Single(Node),
    Multi(Vec<Node>),
}

/// Translates a logical route into concrete target nodes against the given
/// topology snapshot, validating feasibility before any dispatch.
pub(crate) fn resolve_route(
    route: &Route,
    slot_map: &SlotMap,
    topology: &Topology,
    cmd: &Cmd,
    read_from: &ReadFrom,
) -> Result<ResolvedRoute> {
    match route {
        Route::AllNodes => {
            let nodes = multi_node_targets(slot_map, topology, false);
            if nodes.is_empty() {
                return Err(no_nodes_error());
            }
            Ok(ResolvedRoute::Multi(nodes))
        }
        Route::AllPrimaries => {
            let nodes = multi_node_targets(slot_map, topology, true);
            if nodes.is_empty() {
                return Err(no_nodes_error());
            }
            Ok(ResolvedRoute::Multi(nodes))
        }
        Route::Random => topology
            .nodes
            .iter()
            .map(|info| &info.node)
            .choose(&mut rand::rng())
            .cloned()
            .map(ResolvedRoute::Single)
            .ok_or_else(no_nodes_error),
        Route::SlotKey(addr, key) => resolve_slot(get_slot(key), *addr, slot_map, topology, cmd, read_from),
        Route::SlotId(addr, id) => {
            if *id >= SLOT_SIZE {
                return Err(Error::from((
                    ErrorKind::InvalidArgument,
                    "Slot id out of range",
                )));
            }
            resolve_slot(*id, *addr, slot_map, topology, cmd, read_from)
        }
        Route::ByAddress(host, port) => {
            let node = Node::new(host.as_str(), *port);
            if topology.contains(&node) {
                Ok(ResolvedRoute::Single(node))
            } else {
                Err(Error::from((
                    ErrorKind::Routing,
                    "Address is not part of the known topology",
                    node.to_string(),
                )))
            }
        }
    }
}

fn multi_node_targets(slot_map: &SlotMap, topology: &Topology, only_primaries: bool) -> Vec<Node> {
    if slot_map.is_empty() {
        // Standalone deployments have no slot table; fan out over the node
        // list itself.
        return topology
            .nodes
            .iter()
            .filter(|info| !only_primaries || info.role == crate::transport::Role::Primary)
            .map(|info| info.node.clone())
            .collect();
    }
    let nodes = if only_primaries {
        slot_map.nodes_for_all_primaries()
    } else {
        slot_map.nodes_for_all_nodes()
    };
    let mut nodes: Vec<Node> = nodes.into_iter().cloned().collect();
    nodes.sort();
    nodes
}

fn resolve_slot(
    slot: u16,
    addr: SlotAddr,
    slot_map: &SlotMap,
    topology: &Topology,
    cmd: &Cmd,
    read_from: &ReadFrom,
) -> Result<ResolvedRoute> {
    let shard = slot_map.shard_for_slot(slot).ok_or_else(|| {
        Error::from((
            ErrorKind::Routing,
            "No shard covers the requested slot",
            slot.to_string(),
        ))
    })?;

    match addr {
        SlotAddr::Primary => Ok(ResolvedRoute::Single(shard.primary.clone())),
        SlotAddr::Replica => {
            if shard.replicas.is_empty() {
                return Err(Error::from((
                    ErrorKind::Routing,
                    "No replica exists for the requested slot",
                    slot.to_string(),
                )));
            }
            let node = if is_readonly_cmd(cmd) {
                pick_read_node(shard, topology, read_from)
            } else {
                pick_random_replica(shard)
            };
            Ok(ResolvedRoute::Single(node))
        }
    }
}

fn pick_random_replica(shard: &ShardAddrs) -> Node {
    shard
        .replicas
        .iter()
        .choose(&mut rand::rng())
        .cloned()
        .unwrap_or_else(|| shard.primary.clone())
}

fn pick_replica_or_primary(shard: &ShardAddrs) -> Node {
    shard
        .replicas
        .iter()
        .chain(std::iter::once(&shard.primary))
        .choose(&mut rand::rng())
        .cloned()
        .unwrap_or_else(|| shard.primary.clone())
}

/// Applies the read-preference policy to a replica-addressed read.
fn pick_read_node(shard: &ShardAddrs, topology: &Topology, read_from: &ReadFrom) -> Node {
    match read_from {
        ReadFrom::Primary => pick_random_replica(shard),
        ReadFrom::PreferReplica => pick_random_replica(shard),
        ReadFrom::AzAffinity(zone) => shard
            .replicas
            .iter()
            .filter(|node| topology.zone_of(node).map(|z| z.as_str()) == Some(zone.as_str()))
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| pick_random_replica(shard)),
        // The unmatched-zone fallback spreads over the same candidate set
        // the policy names: replicas plus the primary.
        ReadFrom::AzAffinityReplicasAndPrimary(zone) => shard
            .replicas
            .iter()
            .chain(std::iter::once(&shard.primary))
            .filter(|node| topology.zone_of(node).map(|z| z.as_str()) == Some(zone.as_str()))
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| pick_replica_or_primary(shard)),
    }
}

fn no_nodes_error() -> Error {
    Error::from((ErrorKind::Routing, "No nodes in the current topology"))
}
