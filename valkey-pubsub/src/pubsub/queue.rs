use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;

use crate::errors::{closed_connection_error, Result};
use crate::pubsub::PubSubMessage;

const LOCK_ERR: &str = "message queue lock poisoned";

/// The retrievable message queue of a client.
///
/// One internal FIFO feeds every consumption style: non-blocking pop,
/// blocking wait, signal-driven draining, and caller-driven polling (which is
/// just repeated pop). Cloning the handle shares the same queue.
#[derive(Debug, Clone, Default)]
pub struct MessageQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Debug, Default)]
struct QueueInner {
    messages: VecDeque<PubSubMessage>,
    waiters: VecDeque<oneshot::Sender<PubSubMessage>>,
    signals: HashMap<u64, UnboundedSender<()>>,
    next_signal_id: u64,
}

/// Keeps a signal registration alive; dropping it unregisters the signal.
pub struct SignalGuard {
    queue: MessageQueue,
    id: u64,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.queue.unregister_signal(self.id);
    }
}

impl SignalGuard {
    /// The registration id, usable with
    /// [`MessageQueue::unregister_signal`] directly.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a message, serving the oldest live waiter first.
    ///
    /// Fires registered signals only when the queue transitions from empty to
    /// non-empty, so consecutive arrivals may coalesce into one signal.
    pub(crate) fn push(&self, message: PubSubMessage) {
        let mut inner = self.inner.lock().expect(LOCK_ERR);
        let mut message = message;
        // A waiter whose receiver was dropped was abandoned; skip it.
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(message) {
                Ok(()) => return,
                Err(returned) => message = returned,
            }
        }
        let was_empty = inner.messages.is_empty();
        inner.messages.push_back(message);
        if was_empty {
            inner.signals.retain(|_, signal| signal.send(()).is_ok());
        }
    }

    /// Returns the next message immediately, or `None` if the queue is empty.
    /// Never suspends.
    pub fn try_pop(&self) -> Option<PubSubMessage> {
        self.inner.lock().expect(LOCK_ERR).messages.pop_front()
    }

    /// Waits for the next message, suspending the caller until one arrives.
    ///
    /// Outstanding waiters are served in FIFO order. Dropping the returned
    /// future abandons the wait without consuming a message.
    pub async fn wait_for_message(&self) -> Result<PubSubMessage> {
        let receiver = {
            let mut inner = self.inner.lock().expect(LOCK_ERR);
            if inner.waiters.is_empty() {
                if let Some(message) = inner.messages.pop_front() {
                    return Ok(message);
                }
            }
            let (sender, receiver) = oneshot::channel();
            inner.waiters.push_back(sender);
            receiver
        };
        receiver.await.map_err(|_| closed_connection_error())
    }

    /// Registers a signal handle fired whenever the queue becomes non-empty.
    ///
    /// The consumer drains the queue via [`Self::try_pop`] after each signal.
    /// The registration is removed when the guard is dropped.
    pub fn register_signal(&self) -> (SignalGuard, UnboundedReceiver<()>) {
        let (sender, receiver) = unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().expect(LOCK_ERR);
            let id = inner.next_signal_id;
            inner.next_signal_id += 1;
            inner.signals.insert(id, sender);
            id
        };
        (
            SignalGuard {
                queue: self.clone(),
                id,
            },
            receiver,
        )
    }

    /// Removes a signal registration. Unregistering twice is a no-op.
    pub fn unregister_signal(&self, id: u64) {
        self.inner.lock().expect(LOCK_ERR).signals.remove(&id);
    }

    /// Number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().expect(LOCK_ERR).messages.len()
    }

    /// True if no message is currently buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
