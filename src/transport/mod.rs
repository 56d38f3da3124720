//! Wire transport
//!
//! A duplex, message-framed connection to the gateway. One `Transport` is
//! owned per shard and re-opened on every reconnect; `close` may be called
//! from any task and unblocks a pending `read`.

mod inflate;
pub mod memory;
mod websocket;

pub use inflate::inflate;
pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;

use crate::error::GatewayError;
use async_trait::async_trait;
use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Duplex frame transport used by a shard
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to `url`, replacing any previous one.
    async fn open(&self, url: &str, headers: &HeaderMap) -> Result<(), GatewayError>;

    /// Wait for the next complete inbound message.
    ///
    /// Compressed binary frames are inflated before being returned. Returns
    /// `GatewayError::Closed` once the connection is closed from either side.
    async fn read(&self) -> Result<Vec<u8>, GatewayError>;

    /// Send one text frame.
    async fn write(&self, frame: String) -> Result<(), GatewayError>;

    /// Close the connection. Idempotent.
    async fn close(&self);

    /// Whether a connection is currently open
    fn is_connected(&self) -> bool;
}

/// Error returned by `read` after a local `close`
pub(crate) fn closed_locally() -> GatewayError {
    GatewayError::Closed {
        code: None,
        reason: "closed locally".to_string(),
    }
}
