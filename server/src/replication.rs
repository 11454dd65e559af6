//! Cross-ingest replication
//!
//! Every event an ingest produces is published on one shared channel so the
//! other ingests can deliver it to their own clients. Payloads travel inside
//! an [`Envelope`] naming the ingest that produced them; an ingest ignores
//! its own envelopes because it has already delivered them locally.

use crate::error::ServerError;
use crate::hub::{HubHandle, Route};
use crate::store::Store;
use crate::utils::backoff;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;

/// Subscription attempts before the ingest gives up.
pub const MAX_SUBSCRIBE_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<'a> {
    /// Ingest id of the producer
    pub origin: i64,
    /// Explicit route for direct sends; broadcasts are routed by content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    /// The client wire bytes, verbatim
    #[serde(borrow)]
    pub payload: &'a RawValue,
}

pub struct Replicator {
    store: Arc<dyn Store>,
    channel: String,
    origin: i64,
}

impl Replicator {
    pub fn new(store: Arc<dyn Store>, channel: impl Into<String>, origin: i64) -> Self {
        Self {
            store,
            channel: channel.into(),
            origin,
        }
    }

    pub fn wrap(
        &self,
        route: Option<&Route>,
        payload: &[u8],
    ) -> Result<Vec<u8>, serde_json::Error> {
        let payload: &RawValue = serde_json::from_slice(payload)?;
        serde_json::to_vec(&Envelope {
            origin: self.origin,
            route: route.map(Route::to_string),
            payload,
        })
    }

    /// Opens an envelope from the channel. Returns `None` for envelopes this
    /// ingest produced.
    pub fn open(
        &self,
        data: &[u8],
    ) -> Result<Option<(Option<Route>, Vec<u8>)>, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(data)?;
        if envelope.origin == self.origin {
            return Ok(None);
        }

        let route = envelope.route.as_deref().map(Route::parse);
        Ok(Some((route, envelope.payload.get().as_bytes().to_vec())))
    }

    /// Publishes a locally produced event. Failures are logged; local
    /// delivery does not depend on them.
    pub async fn publish(&self, route: Option<&Route>, payload: &[u8]) {
        let envelope = match self.wrap(route, payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Cannot replicate event: {}", e);
                return;
            }
        };

        if let Err(e) = self.store.publish(&self.channel, envelope).await {
            error!("Failed to publish event on {}: {}", self.channel, e);
        }
    }

    /// Forwards peer events to the local hub until the subscription cannot
    /// be re-established.
    pub async fn run(self: Arc<Self>, hub: HubHandle) -> Result<(), ServerError> {
        let mut attempts = 0;

        loop {
            match self.store.subscribe(&self.channel).await {
                Ok(mut messages) => {
                    info!("Replicating events on channel {}", self.channel);
                    attempts = 0;

                    while let Some(data) = messages.recv().await {
                        match self.open(&data) {
                            Ok(Some((route, payload))) => hub.deliver_remote(route, payload),
                            Ok(None) => {}
                            Err(e) => debug!("Ignoring malformed envelope: {}", e),
                        }
                    }
                    warn!("Subscription to {} closed", self.channel);
                }
                Err(e) => warn!("Failed to subscribe to {}: {}", self.channel, e),
            }

            attempts += 1;
            if attempts >= MAX_SUBSCRIBE_ATTEMPTS {
                return Err(ServerError::SubscriptionLost {
                    channel: self.channel.clone(),
                    attempts,
                });
            }
            tokio::time::sleep(backoff(attempts)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn replicator(origin: i64) -> Replicator {
        Replicator::new(Arc::new(MemoryStore::new()), "room", origin)
    }

    #[test]
    fn test_envelope_round_trip() {
        let producer = replicator(1);
        let consumer = replicator(2);
        let payload = br#"{"type":"chat","id":"a","room":"lobby","message":"hi"}"#;

        let envelope = producer.wrap(None, payload).unwrap();
        let (route, bytes) = consumer.open(&envelope).unwrap().unwrap();

        assert!(route.is_none());
        assert_eq!(bytes, payload.to_vec());
    }

    #[test]
    fn test_own_envelopes_are_skipped() {
        let producer = replicator(1);
        let envelope = producer.wrap(None, br#"{"type":"song_ended","id":"s"}"#).unwrap();
        assert!(producer.open(&envelope).unwrap().is_none());
    }

    #[test]
    fn test_direct_route_survives() {
        let producer = replicator(1);
        let consumer = replicator(2);
        let route = Route::character("c1");

        let envelope = producer
            .wrap(Some(&route), br#"{"type":"status","id":"c2","online":false,"active":false}"#)
            .unwrap();
        let (received, _) = consumer.open(&envelope).unwrap().unwrap();
        assert_eq!(received, Some(route));
    }

    #[test]
    fn test_rejects_non_json_payload() {
        assert!(replicator(1).wrap(None, b"not json").is_err());
        assert!(replicator(1).open(b"{}").is_err());
    }
}
