//! Event sinks: destinations for normalized inference events.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use super::Event;
use crate::error::GeppettoError;

/// A destination for [`Event`]s.
///
/// Publishing is synchronous and called from the task that drives the
/// provider stream, in merger order. Sinks that need to hand events to
/// other tasks do so themselves (see [`ChannelSink`]).
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError>;
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError> {
        (**self).publish_event(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish_event(&self, _event: &Event) -> Result<(), GeppettoError> {
        Ok(())
    }
}

/// Records every event in memory.
///
/// Handy for tests and for callers that want the full event log of an
/// inference after the fact.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
}

impl fmt::Debug for CollectingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingSink")
            .field("events", &self.len())
            .finish()
    }
}

impl CollectingSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The `type` tags of all recorded events, in order.
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.event_type().to_string())
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for CollectingSink {
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events into a bounded tokio channel.
///
/// A full channel is reported as an error rather than blocking the
/// streaming task; engines log and drop it.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
}

impl ChannelSink {
    /// A sink plus the receiving half, with room for `capacity` events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn publish_event(&self, event: &Event) -> Result<(), GeppettoError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GeppettoError::InvalidRequest("event channel is full".into())
            }
            mpsc::error::TrySendError::Closed(_) => {
                GeppettoError::InvalidRequest("event channel is closed".into())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventMetadata;

    #[test]
    fn test_null_sink_accepts() {
        NullSink
            .publish_event(&Event::start(EventMetadata::default()))
            .unwrap();
    }

    #[test]
    fn test_collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        sink.publish_event(&Event::start(EventMetadata::default())).unwrap();
        sink.publish_event(&Event::final_text("x", EventMetadata::default()))
            .unwrap();
        assert_eq!(sink.event_types(), vec!["start", "final"]);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_and_reports_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.publish_event(&Event::start(EventMetadata::default())).unwrap();
        let err = sink
            .publish_event(&Event::start(EventMetadata::default()))
            .unwrap_err();
        assert!(err.to_string().contains("full"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type(), "start");
    }

    #[test]
    fn test_arc_sink_delegates() {
        let sink = Arc::new(CollectingSink::new());
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        dyn_sink
            .publish_event(&Event::start(EventMetadata::default()))
            .unwrap();
        assert_eq!(sink.len(), 1);
    }
}
