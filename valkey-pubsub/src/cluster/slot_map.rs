use std::collections::{BTreeMap, HashSet};

use crate::transport::{Node, SlotSpan, Topology};

pub(crate) const SLOT_SIZE: u16 = 16384;

#[derive(Debug)]
struct SlotMapValue {
    start: u16,
    addrs: ShardAddrs,
}

/// The primary and replicas serving one slot span.
#[derive(Debug, Clone)]
pub(crate) struct ShardAddrs {
    pub(crate) primary: Node,
    pub(crate) replicas: Box<[Node]>,
}

impl ShardAddrs {
    fn from_span(span: SlotSpan) -> Self {
        Self {
            primary: span.primary,
            replicas: span.replicas.into_boxed_slice(),
        }
    }
}

impl<'a> IntoIterator for &'a ShardAddrs {
    type Item = &'a Node;
    type IntoIter = std::iter::Chain<std::iter::Once<&'a Node>, std::slice::Iter<'a, Node>>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }
}

/// Maps hash slots to the shard that owns them.
#[derive(Debug, Default)]
pub(crate) struct SlotMap {
    slots: BTreeMap<u16, SlotMapValue>,
}

impl SlotMap {
    pub(crate) fn from_topology(topology: &Topology) -> Self {
        Self {
            slots: topology
                .slots
                .iter()
                .cloned()
                .map(|span| {
                    (
                        span.end,
                        SlotMapValue {
                            start: span.start,
                            addrs: ShardAddrs::from_span(span),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Returns the shard owning `slot`, if the slot is covered.
    pub(crate) fn shard_for_slot(&self, slot: u16) -> Option<&ShardAddrs> {
        self.slots
            .range(slot..)
            .next()
            .and_then(|(end, slot_value)| {
                if slot <= *end && slot_value.start <= slot {
                    Some(&slot_value.addrs)
                } else {
                    None
                }
            })
    }

    fn all_unique_nodes(&self, only_primaries: bool) -> HashSet<&Node> {
        let mut nodes = HashSet::new();
        if only_primaries {
            nodes.extend(self.slots.values().map(|value| &value.addrs.primary));
        } else {
            nodes.extend(self.slots.values().flat_map(|value| &value.addrs));
        }
        nodes
    }

    pub(crate) fn nodes_for_all_primaries(&self) -> HashSet<&Node> {
        self.all_unique_nodes(true)
    }

    pub(crate) fn nodes_for_all_nodes(&self) -> HashSet<&Node> {
        self.all_unique_nodes(false)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(host: &str, port: u16) -> Node {
        Node::new(host, port)
    }

    fn span(start: u16, end: u16, primary: Node, replicas: Vec<Node>) -> SlotSpan {
        SlotSpan {
            start,
            end,
            primary,
            replicas,
        }
    }

    fn topology_of(slots: Vec<SlotSpan>) -> Topology {
        Topology {
            nodes: vec![],
            slots,
        }
    }

    #[test]
    fn test_slot_map_lookup() {
        let slot_map = SlotMap::from_topology(&topology_of(vec![
            span(1, 1000, node("node1", 6379), vec![node("replica1", 6379)]),
            span(1001, 2000, node("node2", 6379), vec![node("replica2", 6379)]),
        ]));

        for slot in [1, 500, 1000] {
            assert_eq!(
                slot_map.shard_for_slot(slot).unwrap().primary,
                node("node1", 6379)
            );
        }
        for slot in [1001, 1500, 2000] {
            assert_eq!(
                slot_map.shard_for_slot(slot).unwrap().primary,
                node("node2", 6379)
            );
        }
        assert!(slot_map.shard_for_slot(0).is_none());
        assert!(slot_map.shard_for_slot(2001).is_none());
    }

    #[test]
    fn test_slot_map_unique_node_sets() {
        let slot_map = SlotMap::from_topology(&topology_of(vec![
            span(0, 1000, node("node1", 6379), vec![node("replica1", 6379)]),
            span(
                1001,
                2000,
                node("node2", 6379),
                vec![node("replica2", 6379), node("replica3", 6379)],
            ),
            span(
                2001,
                16383,
                node("node2", 6379),
                vec![node("replica2", 6379), node("replica3", 6379)],
            ),
        ]));

        let primaries = slot_map.nodes_for_all_primaries();
        assert_eq!(primaries.len(), 2);
        assert!(primaries.contains(&node("node1", 6379)));
        assert!(primaries.contains(&node("node2", 6379)));

        let all = slot_map.nodes_for_all_nodes();
        assert_eq!(all.len(), 5);
        assert!(all.contains(&node("replica3", 6379)));
    }

    #[test]
    fn test_shard_without_replicas() {
        let slot_map = SlotMap::from_topology(&topology_of(vec![span(
            0,
            16383,
            node("node1", 6379),
            vec![],
        )]));
        let shard = slot_map.shard_for_slot(42).unwrap();
        assert!(shard.replicas.is_empty());
    }
}
