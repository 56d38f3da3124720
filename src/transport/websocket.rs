//! tokio-tungstenite backed transport

use super::{closed_locally, inflate, Transport};
use crate::error::GatewayError;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a graceful close may take before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// One open socket, split so reads and writes never wait on each other
struct Connection {
    sink: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    stream: tokio::sync::Mutex<SplitStream<WsStream>>,
    closed: watch::Sender<bool>,
}

/// Secure WebSocket transport
pub struct WebSocketTransport {
    connection: Mutex<Option<Arc<Connection>>>,
    connected: AtomicBool,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Option<Arc<Connection>> {
        self.connection.lock().clone()
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str, headers: &HeaderMap) -> Result<(), GatewayError> {
        self.close().await;

        let connect_error = |source: Box<dyn std::error::Error + Send + Sync>| GatewayError::Connect {
            url: url.to_string(),
            source,
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(Box::new(e)))?;
        request
            .headers_mut()
            .extend(headers.iter().map(|(name, value)| (name.clone(), value.clone())));

        let (socket, response) = connect_async(request)
            .await
            .map_err(|e| connect_error(Box::new(e)))?;
        debug!(url, status = %response.status(), "WebSocket upgraded");

        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);

        *self.connection.lock() = Some(Arc::new(Connection {
            sink: tokio::sync::Mutex::new(sink),
            stream: tokio::sync::Mutex::new(stream),
            closed,
        }));
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, GatewayError> {
        let connection = self.current().ok_or_else(closed_locally)?;
        let mut closed = connection.closed.subscribe();
        let mut stream = connection.stream.lock().await;

        loop {
            let message = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => return Err(closed_locally()),
                message = stream.next() => message,
            };

            match message {
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return inflate(&data),
                Some(Ok(Message::Close(frame))) => {
                    self.connected.store(false, Ordering::SeqCst);
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                        .unwrap_or((None, String::new()));
                    return Err(GatewayError::Closed { code, reason });
                }
                Some(Ok(other)) => {
                    trace!(kind = ?other, "Skipping control frame");
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(GatewayError::Transport(Box::new(e)));
                }
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(GatewayError::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                }
            }
        }
    }

    async fn write(&self, frame: String) -> Result<(), GatewayError> {
        let connection = self.current().ok_or(GatewayError::NotConnected)?;
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }

        let mut sink = connection.sink.lock().await;
        sink.send(Message::Text(frame))
            .await
            .map_err(|e| GatewayError::Transport(Box::new(e)))?;
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let Some(connection) = self.connection.lock().take() else {
            return;
        };

        connection.closed.send_replace(true);

        let graceful = async {
            let mut sink = connection.sink.lock().await;
            sink.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, graceful).await {
            Ok(Ok(())) => debug!("WebSocket closed"),
            Ok(Err(e)) => debug!(error = %e, "WebSocket close handshake failed"),
            Err(_) => debug!("WebSocket close timed out"),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
