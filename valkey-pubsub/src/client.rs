use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cluster::{route_command, ReadFrom, Route, RoutedResponse, SlotAddr};
use crate::cmd::{cmd, Cmd};
use crate::errors::{Error, ErrorKind, Result};
use crate::pubsub::synchronizer::{SubscriptionSynchronizer, DEFAULT_RECONCILIATION_INTERVAL};
use crate::pubsub::{
    ChannelKind, MessageQueue, PubSubMessage, SubscribeMode, SubscriptionSet, SubscriptionSnapshot,
};
use crate::transport::Transport;
use crate::types::Statistics;

static CLIENT_COUNT: AtomicUsize = AtomicUsize::new(0);

/// A callback invoked for every delivered message in callback-only mode.
pub type MessageCallback = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// How delivered messages reach the consumer.
#[derive(Clone, Default)]
pub enum DeliveryMode {
    /// Messages land in a retrievable [`MessageQueue`].
    #[default]
    Queue,
    /// Messages are handed to the callback; the pull APIs are disabled.
    Callback(MessageCallback),
}

/// Client construction parameters.
#[derive(Clone)]
pub struct ClientConfig {
    /// True when the transport fronts a cluster deployment. Enables sharded
    /// pub/sub and slot-based routing.
    pub cluster_mode: bool,
    /// Read-preference policy for replica-addressed reads.
    pub read_from: ReadFrom,
    /// Interval between background reconciliation passes.
    pub reconciliation_interval: Duration,
    /// Subscriptions established at construction time; seeded into the
    /// desired set and picked up by the first reconciliation pass.
    pub initial_subscriptions: Option<SubscriptionSet>,
    /// Queue-based or callback-only delivery.
    pub delivery: DeliveryMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cluster_mode: false,
            read_from: ReadFrom::default(),
            reconciliation_interval: DEFAULT_RECONCILIATION_INTERVAL,
            initial_subscriptions: None,
            delivery: DeliveryMode::default(),
        }
    }
}

enum Delivery {
    Queue(MessageQueue),
    Callback(MessageCallback),
}

/// A pub/sub and routing client over an abstract transport.
///
/// The client is safe to share across tasks; all methods take `&self`.
pub struct Client {
    transport: Arc<dyn Transport>,
    cluster_mode: bool,
    read_from: ReadFrom,
    synchronizer: Arc<SubscriptionSynchronizer>,
    delivery: Arc<Delivery>,
    dispatch_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cluster_mode", &self.cluster_mode)
            .field("read_from", &self.read_from)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client over the given transport and starts its background
    /// reconciliation and delivery tasks.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Result<Self> {
        let push_stream = transport.take_push_stream().ok_or_else(|| {
            Error::from((
                ErrorKind::Configuration,
                "Transport push stream already consumed",
            ))
        })?;

        let synchronizer = SubscriptionSynchronizer::new(
            Arc::clone(&transport),
            config.cluster_mode,
            config.reconciliation_interval,
            config.initial_subscriptions,
        );

        let delivery = Arc::new(match config.delivery {
            DeliveryMode::Queue => Delivery::Queue(MessageQueue::new()),
            DeliveryMode::Callback(callback) => Delivery::Callback(callback),
        });

        let dispatch_task = tokio::spawn(dispatch_pushes(
            push_stream,
            Arc::clone(&synchronizer),
            Arc::clone(&delivery),
        ));

        CLIENT_COUNT.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            transport,
            cluster_mode: config.cluster_mode,
            read_from: config.read_from,
            synchronizer,
            delivery,
            dispatch_task: Some(dispatch_task),
        })
    }

    fn collect_channels(
        channels: impl IntoIterator<Item = impl Into<Vec<u8>>>,
    ) -> Vec<Vec<u8>> {
        channels.into_iter().map(Into::into).collect()
    }

    /// Subscribes lazily: intent is recorded and the call returns; the
    /// server-side subscription is established by background reconciliation.
    pub async fn subscribe(
        &self,
        channels: impl IntoIterator<Item = impl Into<Vec<u8>>>,
        kind: ChannelKind,
    ) -> Result<()> {
        self.synchronizer
            .subscribe(Self::collect_channels(channels), kind, SubscribeMode::Lazy)
            .await
    }

    /// Subscribes and waits for server confirmation. A `timeout_ms` of 0
    /// blocks indefinitely; a negative value is rejected up front.
    pub async fn subscribe_blocking(
        &self,
        channels: impl IntoIterator<Item = impl Into<Vec<u8>>>,
        kind: ChannelKind,
        timeout_ms: i64,
    ) -> Result<()> {
        self.synchronizer
            .subscribe(
                Self::collect_channels(channels),
                kind,
                SubscribeMode::Blocking { timeout_ms },
            )
            .await
    }

    /// Unsubscribes lazily. `None` removes every channel of the class.
    pub async fn unsubscribe(
        &self,
        channels: Option<Vec<Vec<u8>>>,
        kind: ChannelKind,
    ) -> Result<()> {
        self.synchronizer
            .unsubscribe(channels, kind, SubscribeMode::Lazy)
            .await
    }

    /// Unsubscribes and waits until the removal is confirmed. Timeout
    /// semantics match [`Client::subscribe_blocking`].
    pub async fn unsubscribe_blocking(
        &self,
        channels: Option<Vec<Vec<u8>>>,
        kind: ChannelKind,
        timeout_ms: i64,
    ) -> Result<()> {
        self.synchronizer
            .unsubscribe(channels, kind, SubscribeMode::Blocking { timeout_ms })
            .await
    }

    /// Returns a snapshot copy of the desired and actual subscription sets.
    pub fn subscriptions(&self) -> SubscriptionSnapshot {
        self.synchronizer.snapshot()
    }

    /// Returns the retrievable message queue.
    ///
    /// Callback-only clients have no queue; pull-based retrieval and
    /// callback delivery are mutually exclusive by design.
    pub fn queue(&self) -> Result<MessageQueue> {
        match &*self.delivery {
            Delivery::Queue(queue) => Ok(queue.clone()),
            Delivery::Callback(_) => Err(Error::from((
                ErrorKind::Configuration,
                "Client is configured for callback delivery; no queue is available",
            ))),
        }
    }

    /// Publishes a message. Sharded publishes route to the primary of the
    /// shard owning the channel's slot; regular publishes go to any node.
    pub async fn publish(
        &self,
        channel: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
        sharded: bool,
    ) -> Result<i64> {
        if sharded && !self.cluster_mode {
            return Err(Error::from((
                ErrorKind::Configuration,
                "Sharded pub/sub requires cluster mode",
            )));
        }
        let channel = channel.into();
        let mut request = cmd(if sharded { "SPUBLISH" } else { "PUBLISH" });
        request.arg(channel.clone()).arg(payload);
        let route = if sharded {
            Route::SlotKey(SlotAddr::Primary, channel)
        } else {
            Route::Random
        };
        self.route(&request, &route).await?.into_value()?.as_int()
    }

    /// Runs an arbitrary command against the given route.
    ///
    /// Fan-out routes always produce the per-node response form; collapsing
    /// is never inferred from response content.
    pub async fn custom_command_with_route(
        &self,
        args: impl IntoIterator<Item = impl Into<Vec<u8>>>,
        route: &Route,
    ) -> Result<RoutedResponse> {
        let request = Cmd::from_args(args);
        if request.command().is_none() {
            return Err(Error::from((
                ErrorKind::InvalidArgument,
                "Empty command",
            )));
        }
        self.route(&request, route).await
    }

    /// Pings along the given route. Uniform fan-out replies collapse to a
    /// single value; disagreement keeps the per-node map.
    pub async fn ping_with_route(
        &self,
        message: Option<&[u8]>,
        route: &Route,
    ) -> Result<RoutedResponse> {
        let mut request = cmd("PING");
        if let Some(message) = message {
            request.arg(message);
        }
        Ok(match self.route(&request, route).await? {
            RoutedResponse::Multi(multi) => multi.collapse_uniform(),
            single => single,
        })
    }

    async fn route(&self, request: &Cmd, route: &Route) -> Result<RoutedResponse> {
        route_command(&*self.transport, request, route, &self.read_from).await
    }

    /// Returns a point-in-time counter snapshot.
    pub fn statistics(&self) -> Statistics {
        let (out_of_sync, last_sync) = self.synchronizer.metrics();
        Statistics {
            total_connections: self.transport.connection_count(),
            total_clients: CLIENT_COUNT.load(Ordering::SeqCst),
            subscription_out_of_sync_count: out_of_sync,
            subscription_last_sync_timestamp: last_sync,
        }
    }

    /// Forces a reconciliation pass now instead of waiting for the interval.
    pub fn trigger_reconciliation(&self) {
        self.synchronizer.trigger_reconciliation();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.synchronizer.shutdown();
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
        CLIENT_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Forwards transport pushes to the configured delivery sink, filtered
/// against the desired subscription set.
async fn dispatch_pushes(
    mut pushes: tokio::sync::mpsc::UnboundedReceiver<crate::types::PushInfo>,
    synchronizer: Arc<SubscriptionSynchronizer>,
    delivery: Arc<Delivery>,
) {
    while let Some(push) = pushes.recv().await {
        let Some((kind, message)) = PubSubMessage::from_push(&push) else {
            continue;
        };
        if !synchronizer.is_desired(kind, &message.channel) {
            log::debug!(
                "dropping message for unsubscribed channel {:?}",
                String::from_utf8_lossy(&message.channel)
            );
            continue;
        }
        match &*delivery {
            Delivery::Queue(queue) => queue.push(message),
            Delivery::Callback(callback) => callback(message),
        }
    }
}
