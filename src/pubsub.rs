//! Topic fan-out bus with per-subscriber bounded queues.
//!
//! Each [`Subscription`] owns a bounded `mpsc` receiver. [`PubSub::publish`]
//! awaits every matching subscriber's queue, so a slow subscriber delays
//! the publisher but no message is ever dropped. The bus chooses latency
//! over loss.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::event::Event;

/// Default per-subscription queue capacity.
pub const DEFAULT_BUFFER: usize = 1024;

/// Derives the topic of a published message. The default maps an event to
/// its `event_type`.
pub type TopicFn = Arc<dyn Fn(&Event) -> String + Send + Sync>;

/// Configuration for [`PubSub::start`].
///
/// # Examples
///
/// ```
/// use grain::PubSubConfig;
///
/// let config = PubSubConfig {
///     buffer: 64,
///     ..PubSubConfig::default()
/// };
/// assert_eq!(config.buffer, 64);
/// ```
#[derive(Clone)]
pub struct PubSubConfig {
    /// Override for the topic derivation. `None` means `event.event_type`.
    pub topic_fn: Option<TopicFn>,
    /// Capacity of each subscription's bounded queue.
    pub buffer: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            topic_fn: None,
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl std::fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("topic_fn", &self.topic_fn.as_ref().map(|_| "<fn>"))
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// A sender slot registered under a topic. The `id` lets
/// [`PubSub::unsubscribe`] find the slot again.
struct SubscriberSlot {
    id: u64,
    sender: mpsc::Sender<Event>,
}

/// Shared bus state: topic → subscriber slots.
struct BusInner {
    topics: HashMap<String, Vec<SubscriberSlot>>,
    next_id: u64,
    closed: bool,
}

/// Topic-keyed fan-out bus.
///
/// `Clone` is cheap and shares the underlying subscriber set. Publishes
/// are serialized by the inner lock: two concurrent publishes cannot
/// interleave differently on two subscriptions.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<Mutex<BusInner>>,
    topic_fn: TopicFn,
    buffer: usize,
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// One subscriber's bounded queue for a single topic.
///
/// Owned by whoever subscribed. Dropping the subscription releases the
/// queue; a stalled publisher unblocks as soon as the receiver is gone.
pub struct Subscription {
    topic: String,
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// The topic this subscription receives.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next message, in publish order.
    ///
    /// Returns `None` after the bus is stopped (or this subscription was
    /// unsubscribed) and the queue has drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Split into topic and raw receiver, for merging several
    /// subscriptions into one stream.
    pub(crate) fn into_parts(self) -> (String, mpsc::Receiver<Event>) {
        (self.topic, self.rx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

impl PubSub {
    /// Start a bus with the given configuration.
    pub fn start(config: PubSubConfig) -> Self {
        let topic_fn = config
            .topic_fn
            .unwrap_or_else(|| Arc::new(|event: &Event| event.event_type.clone()));
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                topics: HashMap::new(),
                next_id: 0,
                closed: false,
            })),
            topic_fn,
            buffer: config.buffer,
        }
    }

    /// Subscribe to `topic`, returning a bounded queue of the configured
    /// capacity.
    ///
    /// Subscribing to a stopped bus yields a subscription that is already
    /// at end-of-stream.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::channel(self.buffer);

        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;
        if inner.closed {
            // Drop the sender: recv() observes end-of-stream immediately.
            drop(tx);
        } else {
            inner
                .topics
                .entry(topic.clone())
                .or_default()
                .push(SubscriberSlot { id, sender: tx });
        }
        Subscription { topic, id, rx }
    }

    /// Publish `event` to every subscription of its topic.
    ///
    /// Blocks until all matching subscriptions have accepted the message.
    /// Subscriptions whose receiver has been dropped are pruned. Publishing
    /// on a stopped bus is a no-op.
    pub async fn publish(&self, event: &Event) {
        let topic = (self.topic_fn)(event);
        let mut inner = self.inner.lock().await;
        if inner.closed {
            tracing::debug!(topic = %topic, "publish on stopped bus dropped");
            return;
        }
        let Some(slots) = inner.topics.get(&topic) else {
            return;
        };

        // Fan out under the lock: per-subscription order is publish order,
        // and a subscriber that has seen this event may rely on everything
        // the publisher did before calling publish.
        let mut dead = Vec::new();
        for slot in slots {
            if slot.sender.send(event.clone()).await.is_err() {
                dead.push(slot.id);
            }
        }
        if !dead.is_empty() {
            if let Some(slots) = inner.topics.get_mut(&topic) {
                slots.retain(|s| !dead.contains(&s.id));
            }
        }
    }

    /// Remove a subscription from the bus and close its queue.
    ///
    /// Buffered messages are discarded with the receiver.
    pub async fn unsubscribe(&self, sub: Subscription) {
        let mut inner = self.inner.lock().await;
        if let Some(slots) = inner.topics.get_mut(&sub.topic) {
            slots.retain(|s| s.id != sub.id);
            if slots.is_empty() {
                inner.topics.remove(&sub.topic);
            }
        }
        // Receiver drops here, releasing any publisher blocked on the queue.
    }

    /// Stop the bus: every subscription sees end-of-stream once its queue
    /// drains, and later publishes are dropped.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.topics.clear();
    }
}
