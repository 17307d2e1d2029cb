//! Fan-out of published messages to communicators.

use crate::configuration::{ConfigStore, Configuration};
use crate::error::{AddressRangeFault, RelayError};
use crate::metrics::counters;
use crate::registry::{ConnectionRegistry, SendOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// The payload written to one communicator for one published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Name of the publishing service.
    pub from: String,
    /// Message body.
    pub msg: String,
    /// Subscriber addresses in this communicator's address space.
    pub ids: Vec<String>,
}

/// Build one envelope per communicator of `generation` for a message from
/// `service`.
///
/// Subscribers without an address at a communicator's index are skipped for
/// that communicator and logged.
#[must_use]
pub fn build_envelopes(generation: &Configuration, service: &str, msg: &str) -> Vec<(String, Envelope)> {
    let subscribers: Vec<_> = generation.subscribers(service).collect();
    generation
        .communicators
        .iter()
        .map(|communicator| {
            let mut ids = Vec::with_capacity(subscribers.len());
            for recipient in &subscribers {
                match recipient.ids.get(communicator.id_index) {
                    Some(id) => ids.push(id.clone()),
                    None => {
                        let fault = AddressRangeFault {
                            recipient: recipient.name.clone(),
                            communicator: communicator.name.clone(),
                            index: communicator.id_index,
                            len: recipient.ids.len(),
                        };
                        warn!("skipping subscriber: {}", fault);
                    }
                }
            }
            let envelope = Envelope {
                from: service.to_string(),
                msg: msg.to_string(),
                ids,
            };
            (communicator.name.clone(), envelope)
        })
        .collect()
}

/// What a successful publish dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Resolved service name.
    pub service: String,
    /// Number of envelopes handed to dispatch tasks.
    pub dispatched: usize,
}

/// Turns `(service token, message)` into per-communicator deliveries.
pub struct Broadcaster {
    config: Arc<ConfigStore>,
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    /// Create a broadcaster over the given configuration and registry.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry }
    }

    /// Resolve `token` to a service and dispatch `msg` to every communicator.
    ///
    /// Dispatch runs on one task per communicator and is not awaited. A
    /// communicator whose queue is full loses the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Unauthorized`] if the token does not belong to a
    /// service of the current generation; nothing is dispatched then.
    pub fn publish(&self, token: &str, msg: &str) -> Result<PublishReceipt, RelayError> {
        let generation = self.config.current();
        let service = self
            .config
            .tokens()
            .resolve_token(token)
            .filter(|name| generation.service(name).is_some())
            .ok_or(RelayError::Unauthorized)?;

        counters::messages_published_total();
        let envelopes = build_envelopes(&generation, &service, msg);
        let dispatched = envelopes.len();
        for (communicator, envelope) in envelopes {
            let payload = serde_json::to_string(&envelope)?;
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                let outcome = registry.send(&communicator, payload);
                counters::envelopes_total(outcome.as_str());
                if outcome == SendOutcome::Dropped {
                    warn!(communicator = %communicator, "send queue full, dropping envelope");
                } else {
                    debug!(communicator = %communicator, outcome = outcome.as_str(), "envelope dispatched");
                }
            });
        }

        Ok(PublishReceipt {
            service,
            dispatched,
        })
    }
}
