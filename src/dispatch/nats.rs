//! NATS JetStream dispatcher
//!
//! Wraps each event in a small JSON envelope and publishes it to
//! `events.<event name>` for downstream workers.

use super::{DispatchError, Dispatcher};
use crate::error::GatewayError;
use async_nats::jetstream::{self, Context as JsContext};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::value::RawValue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subject prefix for dispatched events
pub const EVENTS_SUBJECT: &str = "events";

/// Envelope published for every dispatched event
#[derive(Debug, Serialize)]
pub struct EventEnvelope<'a> {
    pub event_id: String,
    pub event_type: &'a str,
    pub timestamp: u64,
    pub data: &'a RawValue,
}

impl<'a> EventEnvelope<'a> {
    /// Wrap a raw event body; fails if `data` is not valid JSON
    pub fn new(event: &'a str, data: &'a [u8]) -> Result<Self, serde_json::Error> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        Ok(Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event,
            timestamp,
            data: serde_json::from_slice(data)?,
        })
    }
}

/// Subject an event is published on
pub fn subject_for(event: &str) -> String {
    if event.is_empty() {
        return format!("{EVENTS_SUBJECT}.unknown");
    }
    format!("{EVENTS_SUBJECT}.{}", event.to_ascii_lowercase())
}

/// Publishes dispatched events to NATS JetStream
pub struct NatsDispatcher {
    client: async_nats::Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsDispatcher {
    /// Connect to NATS server(s), comma-separated
    pub async fn connect(servers: &str) -> Result<Arc<Self>, GatewayError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| GatewayError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// False once `close` ran
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    async fn publish(&self, subject: String, payload: Vec<u8>) -> Result<(), DispatchError> {
        let publish_error = |subject: &str, source: Box<dyn std::error::Error + Send + Sync>| {
            DispatchError::Publish {
                subject: subject.to_string(),
                source,
            }
        };

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| publish_error(&subject, Box::new(e)))?
            .await
            .map_err(|e| publish_error(&subject, Box::new(e)))?;

        debug!(subject, stream = %ack.stream, seq = ack.sequence, "Event published");
        Ok(())
    }

    /// Flush pending publishes and mark the dispatcher disconnected
    pub async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(
            published = self.messages_published(),
            failures = self.publish_failures(),
            "NATS dispatcher closed"
        );
    }
}

#[async_trait]
impl Dispatcher for NatsDispatcher {
    async fn dispatch(&self, event: &str, data: &[u8]) -> Result<(), DispatchError> {
        let envelope = EventEnvelope::new(event, data).map_err(|source| DispatchError::Encode {
            event: event.to_string(),
            source,
        })?;
        let payload = serde_json::to_vec(&envelope).map_err(|source| DispatchError::Encode {
            event: event.to_string(),
            source,
        })?;

        match self.publish(subject_for(event), payload).await {
            Ok(()) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_routing() {
        assert_eq!(subject_for("GUILD_CREATE"), "events.guild_create");
        assert_eq!(subject_for("READY"), "events.ready");
        assert_eq!(subject_for(""), "events.unknown");
    }

    #[test]
    fn envelope_embeds_raw_body() {
        let envelope = EventEnvelope::new("GUILD_CREATE", br#"{"id":"1","name":"Test Guild"}"#).unwrap();
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["event_type"], "GUILD_CREATE");
        assert_eq!(json["data"]["name"], "Test Guild");
        assert!(Uuid::parse_str(json["event_id"].as_str().unwrap()).is_ok());
        assert!(json["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn envelope_rejects_invalid_body() {
        assert!(EventEnvelope::new("READY", b"{not json").is_err());
    }
}
