//! The per-inference context: cancellation plus carried event sinks.

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::events::{Event, EventSink};

/// Everything an inference carries besides the [`Turn`](crate::Turn).
///
/// Cloning is cheap. A context is cancelled through its
/// [`CancellationToken`]; contexts derived with [`child`](Self::child)
/// are cancelled with their parent but can also be cancelled alone
/// (the tool loop uses this for per-call timeouts).
///
/// ```rust
/// use std::sync::Arc;
/// use geppetto::InferenceContext;
/// use geppetto::events::{CollectingSink, EventSink};
///
/// let sink = Arc::new(CollectingSink::new());
/// let ctx = InferenceContext::new().with_event_sinks([sink.clone() as Arc<dyn EventSink>]);
/// assert_eq!(ctx.event_sinks().len(), 1);
///
/// let child = ctx.child();
/// ctx.cancel();
/// assert!(child.is_cancelled());
/// ```
#[derive(Clone, Default)]
pub struct InferenceContext {
    cancel: CancellationToken,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl fmt::Debug for InferenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl InferenceContext {
    /// A fresh, uncancelled context with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context driven by an existing cancellation token.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            sinks: Vec::new(),
        }
    }

    /// A derived context: same sinks, child cancellation token.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            sinks: self.sinks.clone(),
        }
    }

    /// A derived context with `sinks` appended to the carried ones.
    #[must_use]
    pub fn with_event_sinks(&self, sinks: impl IntoIterator<Item = Arc<dyn EventSink>>) -> Self {
        let mut next = self.clone();
        next.sinks.extend(sinks);
        next
    }

    /// The carried sinks.
    pub fn event_sinks(&self) -> &[Arc<dyn EventSink>] {
        &self.sinks
    }

    /// The cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Publishes to every carried sink, ignoring failures.
    pub fn publish_event(&self, event: &Event) {
        if self.sinks.is_empty() {
            trace!(event_type = event.event_type(), "no sinks in context");
            return;
        }
        trace!(
            event_type = event.event_type(),
            sink_count = self.sinks.len(),
            "publishing to context sinks"
        );
        for sink in &self.sinks {
            if let Err(e) = sink.publish_event(event) {
                trace!(event_type = event.event_type(), error = %e, "context sink failed");
            }
        }
    }
}
