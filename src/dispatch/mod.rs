//! Event dispatch boundary
//!
//! A shard hands every dispatch frame's event name and raw JSON body to a
//! `Dispatcher`. Delivery is best-effort and at-most-once: the shard never
//! waits on it, and a dispatcher error is logged without touching the
//! connection.

mod handlers;
mod nats;

pub use handlers::{EventHandler, HandlerTable};
pub use nats::{EventEnvelope, NatsDispatcher};

use crate::error::BoxError;
use async_trait::async_trait;
use thiserror::Error;

/// Failure delivering one event downstream
#[derive(Error, Debug)]
pub enum DispatchError {
    /// A registered handler rejected the event
    #[error("handler for {event} failed: {reason}")]
    Handler { event: String, reason: String },

    /// The event body could not be wrapped for publishing
    #[error("failed to encode envelope for {event}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    /// The message bus refused the publish
    #[error("publish to '{subject}' failed")]
    Publish {
        subject: String,
        #[source]
        source: BoxError,
    },
}

/// Receives decoded dispatch events from a shard
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, event: &str, data: &[u8]) -> Result<(), DispatchError>;
}
