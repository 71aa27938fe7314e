//! Live event entry point
//!
//! Events pushed by the tracking emitter bypass the raw event store and the
//! checkpoints: they are formatted and applied immediately.

use serde_json::Value;
use tracing::warn;

use crate::{error::CollectorResult, processor::Processor, types::EventEnvelope};

/// Pushes single events through the pipelines
#[derive(Debug, Clone)]
pub struct LiveEventBackend {
    processor: Processor,
}

impl LiveEventBackend {
    /// Create live backend
    #[must_use]
    pub const fn new(processor: Processor) -> Self {
        Self { processor }
    }

    /// Deliver one event object
    ///
    /// An event without a type or time is logged and ignored. Returns the
    /// number of pipelines that applied the event.
    ///
    /// # Errors
    ///
    /// Returns error if an aggregate write fails
    pub fn send(&self, event: Value) -> CollectorResult<usize> {
        let envelope = match EventEnvelope::from_event(event) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring live event: {}", e);
                return Ok(0);
            }
        };

        self.processor.process_live(&envelope)
    }
}
