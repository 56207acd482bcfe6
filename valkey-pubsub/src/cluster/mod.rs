//! Cluster command routing: translating a logical [`Route`] into concrete
//! target nodes, dispatching, and aggregating fan-out responses.

pub(crate) mod routing;
pub(crate) mod slot_map;

pub use routing::{get_slot, ReadFrom, Route, SlotAddr};

use futures_util::future::join_all;

use crate::cluster::routing::{resolve_route, ResolvedRoute};
use crate::cluster::slot_map::SlotMap;
use crate::cmd::Cmd;
use crate::errors::{Error, ErrorKind, Result};
use crate::transport::{Node, Transport};
use crate::types::Value;

/// The outcome of a routed command.
///
/// Single-node routes always produce [`RoutedResponse::Single`]. Fan-out
/// routes always produce [`RoutedResponse::Multi`]; collapsing identical
/// replies into a single value is opt-in per command (see
/// [`MultiNodeResponse::collapse_uniform`]), never inferred from content.
#[derive(Debug)]
pub enum RoutedResponse {
    /// A single scalar value from one node.
    Single(Value),
    /// Per-node responses from a fan-out route.
    Multi(MultiNodeResponse),
}

impl RoutedResponse {
    /// Converts into a plain value: single values pass through, fan-out
    /// responses become an address-keyed map after the all-or-nothing check.
    pub fn into_value(self) -> Result<Value> {
        match self {
            RoutedResponse::Single(value) => Ok(value),
            RoutedResponse::Multi(multi) => multi.into_value(),
        }
    }
}

/// Aggregated responses of a fan-out route.
///
/// Successful per-node responses are preserved alongside per-node failures;
/// callers that want all-or-nothing semantics use [`Self::into_value`].
#[derive(Debug, Default)]
pub struct MultiNodeResponse {
    /// Successful responses, keyed by node.
    pub values: Vec<(Node, Value)>,
    /// Nodes that failed, with the error each produced.
    pub failures: Vec<(Node, Error)>,
}

impl MultiNodeResponse {
    /// True if every targeted node responded successfully.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// All-or-nothing view: the first per-node error fails the whole call,
    /// otherwise the responses become an address-keyed map.
    pub fn into_value(mut self) -> Result<Value> {
        if let Some((node, err)) = self.failures.pop() {
            return Err(Error::from((
                ErrorKind::Connection,
                "A fan-out target failed",
                format!("{node}: {err}"),
            )));
        }
        Ok(Value::Map(
            self.values
                .into_iter()
                .map(|(node, value)| (Value::BulkString(node.to_string().into_bytes()), value))
                .collect(),
        ))
    }

    /// Collapses into a single value when every node succeeded with an
    /// identical reply; otherwise returns the per-node form unchanged.
    pub fn collapse_uniform(self) -> RoutedResponse {
        if self.failures.is_empty() {
            if let Some((_, first)) = self.values.first() {
                if self.values.iter().all(|(_, value)| value == first) {
                    let value = first.clone();
                    return RoutedResponse::Single(value);
                }
            }
        }
        RoutedResponse::Multi(self)
    }
}

/// Resolves `route` against the transport's current topology and dispatches
/// `cmd`, fanning out concurrently for multi-node routes.
pub(crate) async fn route_command(
    transport: &dyn Transport,
    cmd: &Cmd,
    route: &Route,
    read_from: &ReadFrom,
) -> Result<RoutedResponse> {
    let topology = transport.topology();
    let slot_map = SlotMap::from_topology(&topology);

    match resolve_route(route, &slot_map, &topology, cmd, read_from)? {
        ResolvedRoute::Single(node) => {
            let value = transport.send(&node, cmd).await?;
            Ok(RoutedResponse::Single(value))
        }
        ResolvedRoute::Multi(nodes) => {
            let requests = nodes.iter().map(|node| async move {
                let result = transport.send(node, cmd).await;
                (node.clone(), result)
            });
            let mut response = MultiNodeResponse::default();
            for (node, result) in join_all(requests).await {
                match result {
                    Ok(value) => response.values.push((node, value)),
                    Err(err) => {
                        log::debug!("fan-out request to {node} failed: {err}");
                        response.failures.push((node, err));
                    }
                }
            }
            Ok(RoutedResponse::Multi(response))
        }
    }
}
