//! In-memory transport
//!
//! Scripted stand-in for the gateway socket. Frames pushed with
//! [`MemoryTransport::push`] are returned by `read`, frames the shard writes
//! are recorded and can be awaited with [`MemoryTransport::next_written`].
//! Used by the test suites and for replaying captured traffic locally.

use super::{closed_locally, Transport};
use crate::error::GatewayError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::http::HeaderMap;

enum Inbound {
    Frame(Vec<u8>),
    Close(Option<u16>),
}

pub struct MemoryTransport {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    written_tx: mpsc::UnboundedSender<String>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    opened: watch::Sender<Vec<String>>,
    closed: watch::Sender<bool>,
    connected: AtomicBool,
    open_attempts: AtomicUsize,
    failing_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    closes: AtomicUsize,
    last_headers: Mutex<HeaderMap>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (opened, _) = watch::channel(Vec::new());
        let (closed, _) = watch::channel(true);

        Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
            opened,
            closed,
            connected: AtomicBool::new(false),
            open_attempts: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            open_delay: Mutex::new(Duration::ZERO),
            closes: AtomicUsize::new(0),
            last_headers: Mutex::new(HeaderMap::new()),
        }
    }

    /// Make the next `count` calls to `open` fail
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make every later `open` take `delay` before it completes
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    /// Queue a JSON frame for the shard to read
    pub fn push(&self, frame: Value) {
        self.push_raw(frame.to_string().into_bytes());
    }

    /// Queue raw bytes for the shard to read
    pub fn push_raw(&self, frame: Vec<u8>) {
        let _ = self.inbound_tx.send(Inbound::Frame(frame));
    }

    /// Queue a close frame from the peer
    pub fn push_close(&self, code: Option<u16>) {
        let _ = self.inbound_tx.send(Inbound::Close(code));
    }

    /// Next frame written by the shard, decoded as JSON
    pub async fn next_written(&self) -> Option<Value> {
        let frame = self.written_rx.lock().await.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Frames written so far and not yet taken
    pub fn drain_written(&self) -> Vec<Value> {
        let Ok(mut rx) = self.written_rx.try_lock() else {
            return Vec::new();
        };
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Ok(value) = serde_json::from_str(&frame) {
                frames.push(value);
            }
        }
        frames
    }

    /// Wait until at least `count` connections have been opened; returns their URLs
    pub async fn wait_opened(&self, count: usize) -> Vec<String> {
        let mut opened = self.opened.subscribe();
        let urls = match opened.wait_for(|urls| urls.len() >= count).await {
            Ok(urls) => urls.clone(),
            Err(_) => Vec::new(),
        };
        urls
    }

    /// URLs of every successful `open`
    pub fn opened_urls(&self) -> Vec<String> {
        self.opened.borrow().clone()
    }

    /// Calls to `open`, including failed ones
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Calls to `close` that closed an open connection
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Headers passed to the most recent `open`
    pub fn last_headers(&self) -> HeaderMap {
        self.last_headers.lock().clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str, headers: &HeaderMap) -> Result<(), GatewayError> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_headers.lock() = headers.clone();

        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(GatewayError::Connect {
                url: url.to_string(),
                source: "connection refused".into(),
            });
        }

        self.closed.send_replace(false);
        self.connected.store(true, Ordering::SeqCst);
        self.opened.send_modify(|urls| urls.push(url.to_string()));
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, GatewayError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(closed_locally());
        }
        let mut inbound = self.inbound_rx.lock().await;

        let next = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => return Err(closed_locally()),
            next = inbound.recv() => next,
        };

        match next {
            Some(Inbound::Frame(frame)) => Ok(frame),
            Some(Inbound::Close(code)) => {
                self.connected.store(false, Ordering::SeqCst);
                self.closed.send_replace(true);
                Err(GatewayError::Closed {
                    code,
                    reason: "closed by peer".to_string(),
                })
            }
            None => Err(closed_locally()),
        }
    }

    async fn write(&self, frame: String) -> Result<(), GatewayError> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.written_tx
            .send(frame)
            .map_err(|e| GatewayError::Transport(Box::new(e)))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.closed.send_replace(true) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
