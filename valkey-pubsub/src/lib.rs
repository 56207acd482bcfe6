//! valkey-pubsub is a pub/sub subscription engine and cluster command router
//! for Valkey-compatible deployments.  It keeps server-side subscriptions
//! converged with caller intent through a background reconciliation task and
//! routes commands to cluster nodes by hash slot, role, and availability
//! zone.
//!
//! # Basic Operation
//!
//! The crate is transport-agnostic: callers supply an implementation of the
//! [`Transport`] trait (a connection layer that can send a command to a named
//! node, report the current topology, and surface server pushes), and build a
//! [`Client`] on top of it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use valkey_pubsub::{ChannelKind, Client, ClientConfig, Transport};
//!
//! async fn do_something(transport: Arc<dyn Transport>) -> valkey_pubsub::Result<()> {
//!     let client = Client::new(transport, ClientConfig::default())?;
//!
//!     // Intent is recorded immediately; the server-side subscription is
//!     // established by the background reconciliation pass.
//!     client.subscribe(["news.tech"], ChannelKind::Exact).await?;
//!
//!     let queue = client.queue()?;
//!     let message = queue.wait_for_message().await?;
//!     println!("{message:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Subscription Reconciliation
//!
//! Subscriptions are modeled as two sets per channel class: the desired set
//! (what the caller asked for) and the actual set (what the server has
//! confirmed).  A background task periodically diffs the two and issues
//! batched subscribe/unsubscribe commands to close the gap, so subscriptions
//! survive transient failures without caller involvement.  `subscribe` and
//! `unsubscribe` record intent and return; the `_blocking` variants wait for
//! confirmation with a millisecond timeout, where 0 blocks indefinitely.
//!
//! ## Command Routing
//!
//! Commands run against a [`Route`]: a single node picked by hash slot,
//! address, or randomly, or a fan-out over all nodes or all primaries.
//! Fan-out responses keep their per-node form; identical replies can be
//! collapsed explicitly, never by guessing from response content.
//! Replica-addressed reads honor a [`ReadFrom`] preference, including
//! availability-zone affinity.

#![deny(non_camel_case_types)]
#![warn(missing_docs)]

mod client;
mod cluster;
mod cmd;
mod errors;
mod pubsub;
mod transport;
mod types;

pub use crate::client::{Client, ClientConfig, DeliveryMode, MessageCallback};
pub use crate::cluster::{
    get_slot, MultiNodeResponse, ReadFrom, Route, RoutedResponse, SlotAddr,
};
pub use crate::cmd::{cmd, Cmd};
pub use crate::errors::{Error, ErrorKind, Result};
pub use crate::pubsub::{
    ChannelKind, ChannelName, MessageQueue, PubSubMessage, SignalGuard, SubscribeMode,
    SubscriptionSet, SubscriptionSnapshot, DEFAULT_RECONCILIATION_INTERVAL,
};
pub use crate::transport::{Node, NodeInfo, Role, SlotSpan, Topology, Transport};
pub use crate::types::{PushInfo, PushKind, Statistics, Value};
