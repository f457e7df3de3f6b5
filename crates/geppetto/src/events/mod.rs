//! Normalized inference events and their fan-out.
//!
//! Engines translate provider deltas into a closed set of [`Event`]
//! variants and publish them to every registered [`EventSink`]:
//!
//! ```text
//!   merger ──► Event ──► EventDispatcher ──┬──► configured sinks (warn on failure)
//!                                          └──► context sinks    (best effort)
//! ```
//!
//! Built-in sinks:
//!
//! | Sink | Behavior |
//! |------|----------|
//! | [`NullSink`] | discards |
//! | [`CollectingSink`] | records in memory |
//! | [`ChannelSink`] | forwards into a bounded tokio channel |
//! | [`PubSubSink`] | JSON onto a [`Publisher`] topic, fresh UUID per message |
//! | [`PublisherManager`] | fans out to every registered topic/publisher |

mod event;
mod publisher;
mod sink;

pub use event::{
    Event, EventMetadata, EventPayload, StepMetadata, ToolCallPayload, ToolResultPayload, Usage,
};
pub use publisher::{ChannelPublisher, Message, PubSubSink, Publisher, PublisherManager};
pub use sink::{ChannelSink, CollectingSink, EventSink, NullSink};

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::context::InferenceContext;

/// The publishing half of an engine: statically configured sinks plus
/// whatever sinks ride along on the [`InferenceContext`].
#[derive(Clone, Default)]
pub struct EventDispatcher {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventDispatcher {
    /// A dispatcher over the given configured sinks.
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    /// Adds a configured sink.
    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Number of configured sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is configured.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Publishes to every configured sink, then to the context sinks.
    ///
    /// One failing sink never prevents delivery to the others.
    pub fn publish(&self, ctx: &InferenceContext, event: &Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.publish_event(event) {
                warn!(event_type = event.event_type(), error = %e, "failed to publish event to sink");
            }
        }
        ctx.publish_event(event);
    }
}
