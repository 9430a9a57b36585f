//! Optional per-request observer for provider traffic.
//!
//! A [`TraceSink`] attached to a request receives call, batch, token, and
//! retry events. Entirely optional; the scheduler works without one.

use std::sync::Arc;

/// Events emitted while a request moves through the scheduler.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// A provider call was issued.
    Call {
        /// Resolved endpoint URL.
        endpoint: String,
        /// Model identifier.
        model: String,
    },
    /// A batch was dispatched.
    Batch {
        /// Number of fused requests.
        size: usize,
    },
    /// Tokens arrived on the stream.
    Tokens {
        /// Number of tokens in the delivered chunk.
        count: usize,
    },
    /// A transport retry is about to happen.
    Retry {
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry in milliseconds.
        delay_ms: u64,
        /// Why the retry was triggered.
        reason: String,
    },
}

/// Handler for [`TraceEvent`]s.
pub trait TraceSink: Send + Sync {
    fn on_event(&self, event: TraceEvent);
}

/// Emit an event if a sink is present. No-op otherwise.
pub(crate) fn emit(sink: &Option<Arc<dyn TraceSink>>, event: TraceEvent) {
    if let Some(ref s) = sink {
        s.on_event(event);
    }
}

/// A [`TraceSink`] backed by a closure.
pub struct FnTraceSink<F: Fn(TraceEvent) + Send + Sync>(pub F);

impl<F: Fn(TraceEvent) + Send + Sync> TraceSink for FnTraceSink<F> {
    fn on_event(&self, event: TraceEvent) {
        (self.0)(event);
    }
}
