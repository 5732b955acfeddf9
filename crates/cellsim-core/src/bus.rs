//! Publish/subscribe messaging seam.
//!
//! The core only depends on the [`MessageBus`] trait. [`InProcessBus`]
//! delivers synchronously on the publishing thread, in publish order; the
//! engine binary provides a networked adapter. Delivery failures are the
//! bus's problem: callers log them with [`publish_or_warn`] and carry on.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use cellsim_types::{Command, Envelope, Topic};
use tracing::{trace, warn};

/// A topic subscriber.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Errors raised by a bus adapter.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The envelope could not be encoded for transport.
    #[error("failed to encode envelope for {topic}: {message}")]
    Encode {
        /// Topic being published.
        topic: &'static str,
        /// Encoder message.
        message: String,
    },

    /// The transport rejected the message or the subscription.
    #[error("transport error on {topic}: {message}")]
    Transport {
        /// Topic involved.
        topic: &'static str,
        /// Transport message.
        message: String,
    },

    /// The bus has been shut down.
    #[error("message bus is closed")]
    Closed,
}

/// Logical publish/subscribe contract used by the core.
///
/// Implementations must deliver at least once and preserve publish order
/// per publisher per topic.
pub trait MessageBus: Send + Sync {
    /// Publish `envelope` on its topic.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the envelope cannot be handed to the transport.
    fn publish(&self, envelope: &Envelope) -> Result<(), BusError>;

    /// Register `handler` for every envelope published on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the subscription cannot be established.
    fn subscribe(&self, topic: Topic, handler: Handler) -> Result<(), BusError>;
}

/// Wrap `command` for `tick` and publish it, logging any failure.
///
/// Returns whether the bus accepted the envelope.
pub fn publish_or_warn(bus: &dyn MessageBus, command: Command, tick: u64) -> bool {
    let envelope = Envelope::new(command, tick);
    match bus.publish(&envelope) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                topic = envelope.topic().as_str(),
                tick,
                error = %e,
                "Failed to publish envelope"
            );
            false
        }
    }
}

/// Synchronous in-process bus.
///
/// Handlers run on the publishing thread in registration order. The
/// handler list is snapshotted before delivery, so a handler may publish
/// or subscribe without deadlocking.
#[derive(Default)]
pub struct InProcessBus {
    handlers: RwLock<BTreeMap<Topic, Vec<Handler>>>,
    published: Mutex<BTreeMap<Topic, u64>>,
}

impl core::fmt::Debug for InProcessBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InProcessBus").finish_non_exhaustive()
    }
}

impl InProcessBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes published on `topic` so far.
    pub fn published(&self, topic: Topic) -> u64 {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .copied()
            .unwrap_or(0)
    }
}

impl MessageBus for InProcessBus {
    fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let topic = envelope.topic();
        {
            let mut counts = self.published.lock().unwrap_or_else(PoisonError::into_inner);
            let count = counts.entry(topic).or_insert(0);
            *count = count.saturating_add(1);
        }
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        trace!(
            topic = topic.as_str(),
            subscribers = handlers.len(),
            "Delivering envelope"
        );
        for handler in &handlers {
            handler(envelope);
        }
        Ok(())
    }

    fn subscribe(&self, topic: Topic, handler: Handler) -> Result<(), BusError> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic)
            .or_default()
            .push(handler);
        Ok(())
    }
}
