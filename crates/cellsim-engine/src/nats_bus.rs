//! NATS-backed [`MessageBus`] for the engine.
//!
//! Topics map to subjects `{prefix}.{topic}` and envelopes travel as JSON.
//!
//! # Sync/Async Bridge
//!
//! [`MessageBus`] is synchronous, since it is called from the worker pool.
//! Publishing hands the encoded envelope to a single forwarding task over an
//! unbounded channel, which keeps publish order. Each subscription runs its
//! own task that decodes incoming envelopes and runs the handler on the
//! blocking pool, one message at a time.

use std::sync::Arc;

use async_nats::Client;
use cellsim_core::{BusError, Handler, MessageBus};
use cellsim_types::{Envelope, Topic};
use futures::StreamExt as _;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::EngineError;

type Outgoing = (String, Vec<u8>);

/// Message bus over a NATS connection.
pub struct NatsBus {
    client: Client,
    prefix: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    runtime: Handle,
}

impl NatsBus {
    /// Connect to `url` and start the forwarding task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Nats`] if the connection cannot be established.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, EngineError> {
        info!(url, "Connecting to NATS");
        let client = async_nats::connect(url)
            .await
            .map_err(|e| EngineError::Nats {
                message: format!("failed to connect to {url}: {e}"),
            })?;
        info!("NATS connection established");

        let (outgoing, mut rx) = mpsc::unbounded_channel::<Outgoing>();
        let forwarder = client.clone();
        tokio::spawn(async move {
            while let Some((subject, payload)) = rx.recv().await {
                if let Err(e) = forwarder.publish(subject.clone(), payload.into()).await {
                    warn!(subject, error = %e, "Failed to publish to NATS");
                }
            }
            debug!("NATS forwarder stopped");
        });

        Ok(Self {
            client,
            prefix: prefix.to_owned(),
            outgoing,
            runtime: Handle::current(),
        })
    }

    /// Subject carrying `topic`.
    pub fn subject(&self, topic: Topic) -> String {
        subject_for(&self.prefix, topic)
    }
}

/// `{prefix}.{topic}`, or just the topic when `prefix` is empty.
pub fn subject_for(prefix: &str, topic: Topic) -> String {
    if prefix.is_empty() {
        topic.as_str().to_owned()
    } else {
        format!("{prefix}.{}", topic.as_str())
    }
}

impl MessageBus for NatsBus {
    fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let topic = envelope.topic();
        let payload = serde_json::to_vec(envelope).map_err(|e| BusError::Encode {
            topic: topic.as_str(),
            message: e.to_string(),
        })?;
        self.outgoing
            .send((self.subject(topic), payload))
            .map_err(|_closed| BusError::Closed)
    }

    fn subscribe(&self, topic: Topic, handler: Handler) -> Result<(), BusError> {
        let subject = self.subject(topic);
        let client = self.client.clone();
        self.runtime.spawn(async move {
            let mut subscriber = match client.subscribe(subject.clone()).await {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    warn!(subject, error = %e, "Failed to subscribe on NATS");
                    return;
                }
            };
            info!(subject, "Subscribed on NATS");
            while let Some(message) = subscriber.next().await {
                let envelope: Envelope = match serde_json::from_slice(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(subject, error = %e, "Discarding undecodable envelope");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || handler(&envelope)).await
                {
                    warn!(subject, error = %e, "Bus handler failed");
                }
            }
        });
        Ok(())
    }
}
