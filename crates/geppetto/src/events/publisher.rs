//! Pub/sub plumbing: message bus publishers, the topic fan-out manager,
//! and the sink that bridges events onto a bus.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::{Event, EventSink};
use crate::error::GeppettoError;

/// One opaque bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Fresh UUID per publish.
    pub uuid: String,
    /// Serialized payload (JSON for events).
    pub payload: Vec<u8>,
    /// String metadata (e.g. `sequence_number`).
    pub metadata: HashMap<String, String>,
}

impl Message {
    /// A message with a fresh UUID and no metadata.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            payload,
            metadata: HashMap::new(),
        }
    }
}

/// A message bus that accepts messages for a topic.
pub trait Publisher: Send + Sync {
    /// Publishes one message to `topic`.
    fn publish(&self, topic: &str, message: Message) -> Result<(), GeppettoError>;
}

// ── In-process bus ─────────────────────────────────────────────────

/// An in-process bus backed by one tokio broadcast channel per topic.
///
/// Publishing to a topic nobody subscribed to is not an error; the
/// message is simply dropped.
pub struct ChannelPublisher {
    topics: RwLock<HashMap<String, broadcast::Sender<Message>>>,
    capacity: usize,
}

impl fmt::Debug for ChannelPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ChannelPublisher")
            .field("topics", &topics.keys().collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChannelPublisher {
    /// A bus whose per-topic channels buffer `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to `topic`, creating it if needed.
    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Message> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, topic: &str, message: Message) -> Result<(), GeppettoError> {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = topics.get(topic) {
            // No live receivers is fine.
            let _ = tx.send(message);
        }
        Ok(())
    }
}

// ── Sink onto a bus ────────────────────────────────────────────────

/// Serializes each event to JSON and publishes it to one topic.
pub struct PubSubSink {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl fmt::Debug for PubSubSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubSink")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl PubSubSink {
    /// A sink publishing to `topic` on `publisher`.
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

impl EventSink for PubSubSink {
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError> {
        let payload = serde_json::to_vec(event)?;
        self.publisher
            .publish(&self.topic, Message::new(payload))
            .inspect_err(|e| warn!(topic = %self.topic, error = %e, "failed to publish event"))?;
        trace!(topic = %self.topic, event_type = event.event_type(), "published event");
        Ok(())
    }
}

// ── Fan-out manager ────────────────────────────────────────────────

/// Fans one payload out to every registered topic/publisher pair.
///
/// Registration takes the write lock; publishing only holds the read
/// lock. Each published message carries a `sequence_number` metadata
/// entry that increases by one per [`publish`](Self::publish) call.
/// Delivery is best-effort: publisher failures are logged and skipped.
#[derive(Default)]
pub struct PublisherManager {
    publishers: RwLock<HashMap<String, Vec<Arc<dyn Publisher>>>>,
    sequence_number: AtomicU64,
}

impl fmt::Debug for PublisherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let publishers = self
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PublisherManager")
            .field("topics", &publishers.keys().collect::<Vec<_>>())
            .field(
                "sequence_number",
                &self.sequence_number.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl PublisherManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `publisher` for `topic`.
    pub fn subscribe_publisher(&self, topic: impl Into<String>, publisher: Arc<dyn Publisher>) {
        let mut publishers = self
            .publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        publishers.entry(topic.into()).or_default().push(publisher);
    }

    /// Number of registered topic/publisher pairs.
    pub fn len(&self) -> usize {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether no publisher is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes `payload` and sends it to every registered publisher.
    ///
    /// Only serialization failures are returned.
    pub fn publish<T: serde::Serialize + ?Sized>(&self, payload: &T) -> Result<(), GeppettoError> {
        let bytes = serde_json::to_vec(payload)?;
        let seq = self.sequence_number.fetch_add(1, Ordering::SeqCst);

        let mut message = Message::new(bytes);
        message
            .metadata
            .insert("sequence_number".into(), seq.to_string());

        let publishers = self
            .publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (topic, subs) in publishers.iter() {
            for publisher in subs {
                if let Err(e) = publisher.publish(topic, message.clone()) {
                    warn!(topic = %topic, error = %e, "failed to publish");
                }
            }
        }
        Ok(())
    }

    /// Like [`publish`](Self::publish) but only logs failures.
    pub fn publish_blind<T: serde::Serialize + ?Sized>(&self, payload: &T) {
        if let Err(e) = self.publish(payload) {
            warn!(error = %e, "failed to publish");
        }
    }
}

impl EventSink for PublisherManager {
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError> {
        self.publish(event)
    }
}
