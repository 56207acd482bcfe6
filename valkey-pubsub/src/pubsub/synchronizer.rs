use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::IteratorRandom;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cluster::routing::get_slot;
use crate::cluster::slot_map::SlotMap;
use crate::cmd::cmd;
use crate::errors::{Error, ErrorKind, Result};
use crate::pubsub::{ChannelKind, ChannelName, SubscriptionSet, SubscriptionSnapshot};
use crate::transport::{Node, Topology, Transport};
use crate::types::Value;

const LOCK_ERR: &str = "subscription state lock poisoned";

/// Default interval between background reconciliation passes.
pub const DEFAULT_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(3);

const ALL_KINDS: [ChannelKind; 3] = [
    ChannelKind::Exact,
    ChannelKind::Pattern,
    ChannelKind::Sharded,
];

/// How a subscribe/unsubscribe call waits for server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Record intent and return; confirmation is left to the background
    /// reconciliation pass.
    Lazy,
    /// Wait until the server confirms, up to `timeout_ms` milliseconds.
    /// A timeout of 0 blocks indefinitely; a negative timeout is rejected.
    Blocking {
        /// Millisecond deadline; 0 means no deadline.
        timeout_ms: i64,
    },
}

/// Keeps server-side subscriptions consistent with caller intent.
///
/// Desired and actual sets plus the reconciliation counters live in one
/// mutex-guarded state struct, shared between caller-invoked mutations and
/// the background pass. Readers always take point-in-time copies.
pub(crate) struct SubscriptionSynchronizer {
    state: Mutex<SyncState>,
    reconcile_notify: Notify,
    pass_complete: Notify,
    interval: Duration,
    transport: Arc<dyn Transport>,
    cluster_mode: bool,
    // Exact and pattern subscriptions live on one designated node, so
    // unsubscribes reach the node that holds the subscription.
    subscription_node: Mutex<Option<Node>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct SyncState {
    desired: SubscriptionSet,
    actual: SubscriptionSet,
    out_of_sync_count: u64,
    last_sync_timestamp: u64,
    // Unrecoverable transport error from the pass in progress, surfaced to
    // blocking waiters. Cleared at the start of every pass.
    last_pass_error: Option<Error>,
}

impl SyncState {
    fn is_synchronized(&self) -> bool {
        self.desired == self.actual
    }

    fn insert(set: &mut SubscriptionSet, kind: ChannelKind, channels: &[ChannelName]) {
        set.entry(kind).or_default().extend(channels.iter().cloned());
    }

    fn remove(set: &mut SubscriptionSet, kind: ChannelKind, channels: &[ChannelName]) {
        if let Some(existing) = set.get_mut(&kind) {
            for channel in channels {
                existing.remove(channel);
            }
            if existing.is_empty() {
                set.remove(&kind);
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl SubscriptionSynchronizer {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        cluster_mode: bool,
        interval: Duration,
        initial_subscriptions: Option<SubscriptionSet>,
    ) -> Arc<Self> {
        let mut state = SyncState::default();
        if let Some(initial) = initial_subscriptions {
            for (kind, channels) in initial {
                if !channels.is_empty() {
                    state.desired.insert(kind, channels);
                }
            }
        }
        let synchronizer = Arc::new(Self {
            state: Mutex::new(state),
            reconcile_notify: Notify::new(),
            pass_complete: Notify::new(),
            interval,
            transport,
            cluster_mode,
            subscription_node: Mutex::new(None),
            task: Mutex::new(None),
        });
        synchronizer.start_reconciliation_task();
        synchronizer.trigger_reconciliation();
        synchronizer
    }

    fn start_reconciliation_task(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                {
                    let Some(sync) = weak.upgrade() else {
                        break;
                    };
                    let notified = sync.reconcile_notify.notified();
                    tokio::select! {
                        _ = notified => {},
                        _ = tokio::time::sleep(sync.interval) => {},
                    }
                    sync.reconcile().await;
                }
            }
        });
        *self.task.lock().expect(LOCK_ERR) = Some(handle);
    }

    pub(crate) fn trigger_reconciliation(&self) {
        self.reconcile_notify.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.task.lock().expect(LOCK_ERR).take() {
            handle.abort();
        }
        let mut state = self.state.lock().expect(LOCK_ERR);
        state.desired.clear();
        state.actual.clear();
    }

    /// Snapshot copy of the desired and actual sets; never a live reference.
    pub(crate) fn snapshot(&self) -> SubscriptionSnapshot {
        let state = self.state.lock().expect(LOCK_ERR);
        SubscriptionSnapshot {
            desired: state.desired.clone(),
            actual: state.actual.clone(),
        }
    }

    pub(crate) fn metrics(&self) -> (u64, u64) {
        let state = self.state.lock().expect(LOCK_ERR);
        (state.out_of_sync_count, state.last_sync_timestamp)
    }

    /// True if the message is covered by the desired set of its class.
    pub(crate) fn is_desired(&self, kind: ChannelKind, channel: &[u8]) -> bool {
        let state = self.state.lock().expect(LOCK_ERR);
        match state.desired.get(&kind) {
            Some(channels) if kind == ChannelKind::Pattern => channels
                .iter()
                .any(|pattern| super::glob_match(pattern, channel)),
            Some(channels) => channels.contains(channel),
            None => false,
        }
    }

    fn validate(&self, kind: ChannelKind, mode: SubscribeMode) -> Result<()> {
        if let SubscribeMode::Blocking { timeout_ms } = mode {
            if timeout_ms < 0 {
                return Err(Error::from((
                    ErrorKind::InvalidArgument,
                    "Negative timeout",
                )));
            }
        }
        if kind == ChannelKind::Sharded && !self.cluster_mode {
            return Err(Error::from((
                ErrorKind::Configuration,
                "Sharded pub/sub requires cluster mode",
            )));
        }
        Ok(())
    }

    pub(crate) async fn subscribe(
        &self,
        channels: Vec<ChannelName>,
        kind: ChannelKind,
        mode: SubscribeMode,
    ) -> Result<()> {
        self.validate(kind, mode)?;
        if channels.is_empty() {
            return Err(Error::from((
                ErrorKind::InvalidArgument,
                "No channels provided for subscription",
            )));
        }

        {
            let mut state = self.state.lock().expect(LOCK_ERR);
            SyncState::insert(&mut state.desired, kind, &channels);
        }
        self.trigger_reconciliation();

        match mode {
            SubscribeMode::Lazy => Ok(()),
            SubscribeMode::Blocking { timeout_ms } => {
                self.wait_until(timeout_ms, move |state| {
                    let actual = state.actual.get(&kind);
                    channels
                        .iter()
                        .all(|channel| actual.is_some_and(|set| set.contains(channel)))
                })
                .await
            }
        }
    }

    pub(crate) async fn unsubscribe(
        &self,
        channels: Option<Vec<ChannelName>>,
        kind: ChannelKind,
        mode: SubscribeMode,
    ) -> Result<()> {
        self.validate(kind, mode)?;
        // An empty selector means "every channel of this class".
        let channels = channels.filter(|channels| !channels.is_empty());

        {
            let mut state = self.state.lock().expect(LOCK_ERR);
            match &channels {
                Some(channels) => SyncState::remove(&mut state.desired, kind, channels),
                None => {
                    state.desired.remove(&kind);
                }
            }
        }
        self.trigger_reconciliation();

        match mode {
            SubscribeMode::Lazy => Ok(()),
            SubscribeMode::Blocking { timeout_ms } => {
                self.wait_until(timeout_ms, move |state| match &channels {
                    Some(channels) => {
                        let actual = state.actual.get(&kind);
                        channels
                            .iter()
                            .all(|channel| !actual.is_some_and(|set| set.contains(channel)))
                    }
                    None => !state.actual.contains_key(&kind),
                })
                .await
            }
        }
    }

    /// Waits for reconciliation passes until `done` holds or the deadline
    /// elapses. A `timeout_ms` of 0 waits indefinitely. An unrecoverable
    /// transport failure in a pass fails the wait instead of letting it
    /// spin against a dead connection.
    async fn wait_until(&self, timeout_ms: i64, done: impl Fn(&SyncState) -> bool) -> Result<()> {
        let deadline = (timeout_ms > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_millis(timeout_ms as u64));
        loop {
            // Register for the next completion before checking, so a pass
            // finishing in between cannot be missed.
            let mut notified = std::pin::pin!(self.pass_complete.notified());
            notified.as_mut().enable();
            {
                let state = self.state.lock().expect(LOCK_ERR);
                if done(&state) {
                    return Ok(());
                }
                if let Some(err) = &state.last_pass_error {
                    return Err(Error::from((
                        err.kind(),
                        "Subscription reconciliation failed",
                        err.to_string(),
                    )));
                }
            }
            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, notified)
                        .await
                        .map_err(|_| {
                            Error::from((
                                ErrorKind::Timeout,
                                "Timed out waiting for subscription confirmation",
                            ))
                        })?;
                }
                None => notified.await,
            }
        }
    }

    /// One reconciliation pass: per class, batched subscribes for
    /// desired−actual and batched unsubscribes for actual−desired.
    pub(crate) async fn reconcile(&self) {
        let topology = self.transport.topology();
        self.check_subscription_node(&topology);
        let (to_add, to_remove) = {
            let mut state = self.state.lock().expect(LOCK_ERR);
            state.last_pass_error = None;
            let mut to_add: HashMap<ChannelKind, Vec<ChannelName>> = HashMap::new();
            let mut to_remove: HashMap<ChannelKind, Vec<ChannelName>> = HashMap::new();
            for kind in ALL_KINDS {
                let desired = state.desired.get(&kind);
                let actual = state.actual.get(&kind);
                let missing: Vec<_> = desired
                    .map(|desired| {
                        desired
                            .iter()
                            .filter(|channel| !actual.is_some_and(|set| set.contains(*channel)))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if !missing.is_empty() {
                    to_add.insert(kind, missing);
                }
                let extra: Vec<_> = actual
                    .map(|actual| {
                        actual
                            .iter()
                            .filter(|channel| !desired.is_some_and(|set| set.contains(*channel)))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if !extra.is_empty() {
                    to_remove.insert(kind, extra);
                }
            }
            (to_add, to_remove)
        };

        for (kind, channels) in to_add {
            let acked = self
                .send_batches(kind.subscribe_command(), kind, channels, &topology)
                .await;
            if !acked.is_empty() {
                let mut state = self.state.lock().expect(LOCK_ERR);
                // An acked channel is only promoted if still desired, so an
                // unsubscribe racing a pending ack cannot resurrect it.
                let still_desired: Vec<_> = acked
                    .into_iter()
                    .filter(|channel| {
                        state
                            .desired
                            .get(&kind)
                            .is_some_and(|set| set.contains(channel))
                    })
                    .collect();
                if !still_desired.is_empty() {
                    SyncState::insert(&mut state.actual, kind, &still_desired);
                }
            }
        }

        for (kind, channels) in to_remove {
            let acked = self
                .send_batches(kind.unsubscribe_command(), kind, channels, &topology)
                .await;
            if !acked.is_empty() {
                let mut state = self.state.lock().expect(LOCK_ERR);
                SyncState::remove(&mut state.actual, kind, &acked);
            }
        }

        {
            let mut state = self.state.lock().expect(LOCK_ERR);
            if state.is_synchronized() {
                state.last_sync_timestamp = now_millis();
                log::debug!("subscriptions in sync");
            } else {
                state.out_of_sync_count += 1;
                log::debug!(
                    "subscriptions out of sync - desired: {:?}, actual: {:?}",
                    state.desired,
                    state.actual
                );
            }
        }
        self.pass_complete.notify_waiters();
    }

    /// Sends one batched command per target node and collects the channels
    /// the server acknowledged. Failures are logged and surface through the
    /// out-of-sync counter; unrecoverable transport errors are additionally
    /// recorded for blocking waiters.
    async fn send_batches(
        &self,
        command: &str,
        kind: ChannelKind,
        channels: Vec<ChannelName>,
        topology: &Topology,
    ) -> Vec<ChannelName> {
        let batches = match self.batch_targets(kind, channels, topology) {
            Ok(batches) => batches,
            Err(err) => {
                log::warn!("cannot resolve {command} targets: {err}");
                self.record_pass_error(err);
                return Vec::new();
            }
        };

        let mut acked = Vec::new();
        for (node, batch) in batches {
            let mut request = cmd(command);
            request.arg_each(batch.iter().cloned());
            match self.transport.send(&node, &request).await {
                // Full-batch acknowledgement.
                Ok(Value::Okay) => acked.extend(batch),
                // Per-channel acknowledgement; unacked channels stay pending.
                Ok(other) => match other.as_bulk_strings() {
                    Ok(subset) => {
                        let batch_set: HashSet<_> = batch.iter().collect();
                        acked.extend(
                            subset
                                .into_iter()
                                .filter(|channel| batch_set.contains(channel)),
                        );
                    }
                    Err(_) => log::warn!("unexpected {command} acknowledgement shape"),
                },
                Err(err) => {
                    log::warn!("{command} to {node} failed: {err}");
                    self.record_pass_error(err);
                }
            }
        }
        acked
    }

    fn record_pass_error(&self, err: Error) {
        if err.is_unrecoverable_error() {
            self.state.lock().expect(LOCK_ERR).last_pass_error = Some(err);
        }
    }

    /// Drops the designated subscription node when it leaves the topology.
    /// Its server-side subscriptions went with it, so the exact and pattern
    /// actual sets are reset and the pass re-establishes them elsewhere.
    fn check_subscription_node(&self, topology: &Topology) {
        let mut pinned = self.subscription_node.lock().expect(LOCK_ERR);
        if let Some(node) = pinned.as_ref() {
            if !topology.contains(node) {
                log::warn!("subscription node {node} left the topology");
                *pinned = None;
                let mut state = self.state.lock().expect(LOCK_ERR);
                state.actual.remove(&ChannelKind::Exact);
                state.actual.remove(&ChannelKind::Pattern);
            }
        }
    }

    /// Groups channels by target node: sharded channels go to the primary of
    /// the shard owning their slot; exact and pattern channels go to the
    /// designated subscription node, picked once and reused so subscribes
    /// and unsubscribes land on the same node.
    fn batch_targets(
        &self,
        kind: ChannelKind,
        channels: Vec<ChannelName>,
        topology: &Topology,
    ) -> Result<Vec<(Node, Vec<ChannelName>)>> {
        if self.cluster_mode && kind == ChannelKind::Sharded {
            let slot_map = SlotMap::from_topology(topology);
            let mut batches: HashMap<Node, Vec<ChannelName>> = HashMap::new();
            for channel in channels {
                let shard = slot_map.shard_for_slot(get_slot(&channel)).ok_or_else(|| {
                    Error::from((ErrorKind::Routing, "No shard covers the channel slot"))
                })?;
                batches.entry(shard.primary.clone()).or_default().push(channel);
            }
            Ok(batches.into_iter().collect())
        } else {
            let mut pinned = self.subscription_node.lock().expect(LOCK_ERR);
            let node = match pinned.as_ref() {
                Some(node) => node.clone(),
                None => {
                    let node = topology
                        .primaries()
                        .choose(&mut rand::rng())
                        .cloned()
                        .ok_or_else(|| {
                            Error::from((ErrorKind::Connection, "No nodes in the current topology"))
                        })?;
                    *pinned = Some(node.clone());
                    node
                }
            };
            Ok(vec![(node, channels)])
        }
    }
}
