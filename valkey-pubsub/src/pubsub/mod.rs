//! Pub/sub data model: channel classes, subscription sets, and messages.

pub(crate) mod queue;
pub(crate) mod synchronizer;

pub use queue::{MessageQueue, SignalGuard};
pub use synchronizer::{SubscribeMode, DEFAULT_RECONCILIATION_INTERVAL};

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::types::{PushInfo, PushKind, Value};

/// The class of a pub/sub channel.
///
/// The class determines which subscribe command family applies and which
/// delivery bucket a message lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// An exact channel name.
    Exact,
    /// A glob-style channel pattern.
    Pattern,
    /// A sharded channel, confined to the shard owning its hash slot.
    Sharded,
}

impl ChannelKind {
    pub(crate) fn subscribe_command(&self) -> &'static str {
        match self {
            ChannelKind::Exact => "SUBSCRIBE",
            ChannelKind::Pattern => "PSUBSCRIBE",
            ChannelKind::Sharded => "SSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(&self) -> &'static str {
        match self {
            ChannelKind::Exact => "UNSUBSCRIBE",
            ChannelKind::Pattern => "PUNSUBSCRIBE",
            ChannelKind::Sharded => "SUNSUBSCRIBE",
        }
    }
}

/// A channel or pattern name.
pub type ChannelName = Vec<u8>;

/// Channels grouped per class. Two instances exist per client: the desired
/// set (caller intent) and the actual set (server-confirmed).
pub type SubscriptionSet = HashMap<ChannelKind, HashSet<ChannelName>>;

/// A snapshot copy of the desired and actual subscription sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    /// What the caller asked to be subscribed to.
    pub desired: SubscriptionSet,
    /// What the server has confirmed as active.
    pub actual: SubscriptionSet,
}

/// A message received over pub/sub. Immutable once constructed.
#[derive(Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    /// The concrete channel the message was published to.
    pub channel: ChannelName,
    /// The pattern that matched, set only for pattern-matched deliveries.
    pub pattern: Option<ChannelName>,
    /// The message payload.
    pub payload: Vec<u8>,
}

impl fmt::Debug for PubSubMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubMessage")
            .field("channel", &String::from_utf8_lossy(&self.channel))
            .field(
                "pattern",
                &self.pattern.as_deref().map(String::from_utf8_lossy),
            )
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}

impl PubSubMessage {
    /// Decodes a transport push into a message, returning the class it was
    /// delivered under. Non-message pushes decode to `None`.
    pub(crate) fn from_push(push: &PushInfo) -> Option<(ChannelKind, PubSubMessage)> {
        let bulk = |value: &Value| match value {
            Value::BulkString(bytes) => Some(bytes.clone()),
            _ => None,
        };
        match push.kind {
            PushKind::Message | PushKind::SMessage => {
                let channel = bulk(push.data.first()?)?;
                let payload = bulk(push.data.get(1)?)?;
                let kind = if push.kind == PushKind::SMessage {
                    ChannelKind::Sharded
                } else {
                    ChannelKind::Exact
                };
                Some((
                    kind,
                    PubSubMessage {
                        channel,
                        pattern: None,
                        payload,
                    },
                ))
            }
            PushKind::PMessage => {
                let pattern = bulk(push.data.first()?)?;
                let channel = bulk(push.data.get(1)?)?;
                let payload = bulk(push.data.get(2)?)?;
                Some((
                    ChannelKind::Pattern,
                    PubSubMessage {
                        channel,
                        pattern: Some(pattern),
                        payload,
                    },
                ))
            }
            _ => None,
        }
    }
}

/// Glob matching over channel names, covering the subset the server's
/// pattern subscriptions use: `*`, `?` and `[...]` character classes.
pub(crate) fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') => {
                (0..=text.len()).any(|skip| matches(&pattern[1..], &text[skip..]))
            }
            Some(b'?') => !text.is_empty() && matches(&pattern[1..], &text[1..]),
            Some(b'[') => {
                let Some(close) = pattern.iter().position(|b| *b == b']') else {
                    return text.first() == Some(&b'[') && matches(&pattern[1..], &text[1..]);
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
                hit != negated && matches(&pattern[close + 1..], &text[1..])
            }
            Some(byte) => text.first() == Some(byte) && matches(&pattern[1..], &text[1..]),
        }
    }
    matches(pattern, text)
}
