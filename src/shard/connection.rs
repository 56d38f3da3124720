//! Shard connection life cycle
//!
//! A `Shard` owns one transport and drives it through
//! connect → receive → reconnect for as long as it lives. Inbound frames are
//! read by one task and consumed by another through a bounded queue, so a
//! slow processor applies back-pressure to the socket instead of growing
//! memory. The heartbeat monitor runs beside both.

use super::backoff::{Backoff, BackoffPolicy, BackoffStep};
use super::identify::IdentifyLock;
use super::processor::Processor;
use super::session::SessionState;
use super::state::{ShardPhase, ShardState};
use crate::config::ShardConfig;
use crate::dispatch::{Dispatcher, HandlerTable};
use crate::error::GatewayError;
use crate::heartbeat::{HeartbeatMonitor, HeartbeatTarget};
use crate::metrics;
use crate::protocol::{encode, Identify, IdentifyProperties, OpCode, Payload, Resume, API_VERSION};
use crate::ratelimit::{SendLimiter, SendQuota};
use crate::transport::{closed_locally, Transport, WebSocketTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, error, info, trace, warn};
use twilight_model::gateway::payload::outgoing::update_presence::UpdatePresencePayload;
use twilight_model::gateway::{Intents, ShardId};

/// Close codes after which the previous session cannot be resumed
const SESSION_LOST_CLOSE_CODES: [u16; 2] = [4007, 4009];

/// One gateway connection and its session
pub struct Shard {
    id: ShardId,
    config: ShardConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<dyn Dispatcher>,
    identify_lock: IdentifyLock,
    limiter: SendLimiter,
    session: SessionState,
    heartbeat: Mutex<Option<Arc<HeartbeatMonitor>>>,
    phase: AtomicU8,
    closed: watch::Sender<bool>,
    heartbeat_missed: AtomicBool,
    dispatch_slots: Arc<Semaphore>,
    registry: Option<ShardState>,
}

impl Shard {
    pub fn builder(id: ShardId, token: impl Into<String>) -> ShardBuilder {
        ShardBuilder::new(id, token)
    }

    /// Open the transport, retrying with backoff.
    ///
    /// Session identity is dropped unless the next handshake will resume.
    /// Fails with `BackoffExhausted` once the backoff budget is spent.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        let shard_id = self.id.number();

        if !self.session.can_resume() {
            self.session.reset();
        }
        self.session.begin_connection();
        self.heartbeat_missed.store(false, Ordering::SeqCst);

        let resuming = self.session.can_resume();
        let base = if resuming {
            self.session
                .resume_url()
                .unwrap_or_else(|| self.config.gateway_url.clone())
        } else {
            self.config.gateway_url.clone()
        };
        let url = with_query(&base);

        let mut backoff = self.config.backoff.start();
        loop {
            if self.is_closed() {
                return Err(closed_by_owner());
            }
            self.set_phase(ShardPhase::Connecting);
            debug!(shard_id, url = %url, resuming, "Connecting");

            let attempt = tokio::select! {
                attempt = time::timeout(
                    self.config.connect_timeout,
                    self.transport.open(&url, &self.config.headers),
                ) => attempt,
                _ = self.wait_closed() => return Err(closed_by_owner()),
            };

            let err = match attempt {
                Ok(Ok(())) => {
                    // a close that landed while the open was finishing
                    if self.is_closed() {
                        self.transport.close().await;
                        return Err(closed_by_owner());
                    }
                    self.set_phase(ShardPhase::AwaitingHello);
                    info!(shard_id, resuming, attempts = backoff.attempts() + 1, "Shard connected");
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => GatewayError::ConnectTimeout {
                    url: url.clone(),
                    timeout: self.config.connect_timeout,
                },
            };
            metrics::record_error(shard_id, err.error_type_label());

            match backoff.next_step() {
                BackoffStep::Retry(delay) => {
                    warn!(
                        shard_id,
                        error = %err,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Connect failed, backing off"
                    );
                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = self.wait_closed() => return Err(closed_by_owner()),
                    }
                }
                BackoffStep::Exhausted { attempts, elapsed } => {
                    self.set_phase(ShardPhase::Exhausted);
                    return Err(GatewayError::BackoffExhausted {
                        shard_id,
                        attempts,
                        elapsed,
                        source: Box::new(err),
                    });
                }
            }
        }
    }

    /// Process inbound frames until the connection ends.
    ///
    /// Returns `Ok` only when the shard was closed by its owner; otherwise
    /// the error says why the connection was lost. The connection is closed
    /// and the heartbeat stopped before returning.
    pub async fn receive(self: &Arc<Self>) -> Result<(), GatewayError> {
        let shard_id = self.id.number();
        let (tx, mut rx) = mpsc::channel(self.config.frame_queue_capacity.max(1));

        let reader = tokio::spawn(read_loop(Arc::clone(self), tx));

        let shard = Arc::clone(self);
        let consumer = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                shard.handle_payload(payload).await?;
            }
            Ok::<_, GatewayError>(())
        });

        let consumed = match consumer.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(shard_id, "Packet processor panicked");
                Err(GatewayError::ProcessorPanicked { shard_id })
            }
            Err(_) => Err(closed_by_owner()),
        };

        self.stop_heartbeat();
        self.transport.close().await;

        let read = reader.await.unwrap_or_else(|_| Err(closed_locally()));

        if self.is_closed() {
            return Ok(());
        }

        let err = match consumed.and(read) {
            Err(_) if self.heartbeat_missed.swap(false, Ordering::SeqCst) => {
                GatewayError::HeartbeatMissed { shard_id }
            }
            Err(e) => e,
            Ok(()) => closed_locally(),
        };

        if let Some(resume) = resumable_after(&err) {
            self.session.set_should_resume(resume);
        }
        Err(err)
    }

    /// Supervise the shard: connect, receive, and reconnect after every lost
    /// connection until closed by its owner or stopped by a fatal error.
    pub async fn run(self: &Arc<Self>) -> Result<(), GatewayError> {
        let shard_id = self.id.number();
        info!(shard_id, shard_count = self.id.total(), "Shard starting");

        let mut rejections: Option<Backoff> = None;
        loop {
            if let Err(e) = self.connect().await {
                if self.is_closed() {
                    break;
                }
                metrics::record_error(shard_id, e.error_type_label());
                error!(shard_id, error = %e, "Shard stopped");
                return Err(e);
            }

            let err = match self.receive().await {
                Ok(()) => break,
                Err(e) => e,
            };
            metrics::record_error(shard_id, err.error_type_label());

            if err.is_fatal() {
                self.set_phase(ShardPhase::Exhausted);
                error!(shard_id, error = %err, "Shard stopped");
                return Err(err);
            }

            let mut delay = self.config.reconnect_delay;
            if err.is_rejected_close() {
                let backoff = rejections.get_or_insert_with(|| self.config.backoff.start());
                delay = match backoff.next_step() {
                    BackoffStep::Retry(step) => step,
                    BackoffStep::Exhausted { .. } => self.config.backoff.max_interval,
                }
                .max(delay);
                error!(
                    shard_id,
                    error = %err,
                    rejections = backoff.attempts(),
                    "Gateway rejected the session"
                );
            } else {
                rejections = None;
                if err.is_session_transition() {
                    info!(shard_id, error = %err, "Connection recycled");
                } else {
                    warn!(shard_id, error = %err, "Connection lost");
                }
            }
            self.set_phase(ShardPhase::Faulted);

            let resume = self.session.can_resume();
            metrics::record_reconnect(shard_id, resume);
            if let Some(registry) = &self.registry {
                registry.record_reconnect(shard_id);
            }
            debug!(shard_id, resume, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = self.wait_closed() => break,
            }
        }

        self.set_phase(ShardPhase::Disconnected);
        info!(shard_id, "Shard closed");
        Ok(())
    }

    /// Send one control frame through the rate limiter
    pub async fn send<T: Serialize + Sync>(&self, op: OpCode, data: &T) -> Result<(), GatewayError> {
        self.limiter.acquire().await;
        let frame = encode(op, data)?;
        trace!(shard_id = self.id.number(), op = op.as_u8(), "Sending frame");
        self.transport.write(frame).await
    }

    /// Send a heartbeat carrying the last seen sequence
    pub async fn heartbeat(&self) -> Result<(), GatewayError> {
        self.send(OpCode::Heartbeat, &self.session.heartbeat_sequence()).await
    }

    /// Close the shard from outside its own loop. Unblocks any pending read;
    /// `run` then returns `Ok(())` instead of reconnecting.
    pub async fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(shard_id = self.id.number(), "Closing shard");
        }
        self.set_phase(ShardPhase::Closing);
        self.stop_heartbeat();
        self.transport.close().await;
    }

    pub(crate) async fn identify(&self) -> Result<(), GatewayError> {
        let shard_id = self.id.number();
        self.set_phase(ShardPhase::Identifying);

        let _permit = tokio::select! {
            permit = self.identify_lock.acquire() => permit,
            _ = self.wait_closed() => return Err(closed_by_owner()),
        };

        if self.is_closed() {
            return Err(closed_by_owner());
        }
        let identify = Identify {
            token: &self.config.token,
            properties: &self.config.properties,
            large_threshold: self.config.large_threshold,
            compress: self.config.compress,
            shard: self.id,
            presence: self.config.presence.as_ref(),
            intents: self.config.intents,
        };
        self.send(OpCode::Identify, &identify).await?;

        info!(shard_id, shard_count = self.id.total(), "Identify sent");
        Ok(())
    }

    pub(crate) async fn resume(&self) -> Result<(), GatewayError> {
        let shard_id = self.id.number();
        self.set_phase(ShardPhase::Resuming);

        let session_id = self.session.session_id().unwrap_or_default();
        let seq = self.session.last_sequence();
        let resume = Resume {
            token: &self.config.token,
            session_id: &session_id,
            seq,
        };
        tokio::select! {
            sent = self.send(OpCode::Resume, &resume) => sent?,
            _ = self.wait_closed() => return Err(closed_by_owner()),
        }

        info!(shard_id, session_id = %session_id, seq, "Resume sent");
        Ok(())
    }

    /// Hand a dispatch event to the dispatcher without waiting for delivery.
    /// Waits only for a free dispatch slot.
    pub(crate) async fn forward(&self, event: String, data: Vec<u8>) {
        let shard_id = self.id.number();
        let Ok(permit) = Arc::clone(&self.dispatch_slots).acquire_owned().await else {
            return;
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let registry = self.registry.clone();
        let timeout = self.config.dispatch_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let started = Instant::now();

            let failure = match time::timeout(timeout, dispatcher.dispatch(&event, &data)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("timed out after {timeout:?}")),
            };

            match failure {
                None => {
                    metrics::record_dispatch(shard_id, started.elapsed());
                    if let Some(registry) = &registry {
                        registry.record_dispatch(shard_id);
                    }
                }
                Some(reason) => {
                    warn!(shard_id, event = %event, error = %reason, "Dispatch failed");
                    metrics::record_dispatch_failure(shard_id);
                    if let Some(registry) = &registry {
                        registry.record_dispatch_failure(shard_id);
                    }
                }
            }
        });
    }

    pub(crate) fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let monitor = HeartbeatMonitor::new(self.id.number(), interval);
        monitor.start(Arc::downgrade(self));
        if let Some(previous) = self.heartbeat.lock().replace(monitor) {
            previous.stop();
        }
    }

    pub(crate) fn heartbeat_ack(&self) {
        let monitor = self.heartbeat.lock().clone();
        let Some(latency) = monitor.and_then(|monitor| monitor.ack()) else {
            return;
        };

        let shard_id = self.id.number();
        trace!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
        metrics::record_heartbeat(shard_id, latency);
        if let Some(registry) = &self.registry {
            registry.record_heartbeat(shard_id, latency);
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(monitor) = self.heartbeat.lock().take() {
            monitor.stop();
        }
    }

    fn record_frame(&self, payload: &Payload) {
        let shard_id = self.id.number();
        metrics::record_frame(shard_id, payload.op);
        if let Some(registry) = &self.registry {
            registry.record_event(shard_id);
        }
    }

    async fn handle_payload(self: &Arc<Self>, payload: Payload) -> Result<(), GatewayError> {
        let shard_id = self.id.number();

        if !self.session.hello_received() && payload.opcode() != Some(OpCode::Hello) {
            warn!(shard_id, op = payload.op, "Frame received before hello");
            self.transport.close().await;
            return Err(GatewayError::ProtocolViolation {
                shard_id,
                op: payload.op,
            });
        }

        if let Some(seq) = payload.s {
            self.session.observe_sequence(seq);
        }

        let Some(processor) = Processor::for_opcode(payload.op) else {
            debug!(shard_id, op = payload.op, "Ignoring unhandled opcode");
            return Ok(());
        };
        trace!(shard_id, op = %processor.opcode(), seq = payload.s, event = payload.event_name(), "Frame received");

        processor.process(self, payload).await
    }

    pub(crate) fn set_phase(&self, phase: ShardPhase) {
        let shard_id = self.id.number();
        self.phase.store(phase as u8, Ordering::SeqCst);
        metrics::set_phase(shard_id, phase);
        if let Some(registry) = &self.registry {
            registry.set_phase(shard_id, phase);
            metrics::set_shards_ready(registry.pool_id(), registry.ready_shards());
        }
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn session(&self) -> &SessionState {
        &self.session
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn phase(&self) -> ShardPhase {
        ShardPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.session_id()
    }

    pub fn resume_url(&self) -> Option<String> {
        self.session.resume_url()
    }

    pub fn last_sequence(&self) -> u64 {
        self.session.last_sequence()
    }

    pub fn should_resume(&self) -> bool {
        self.session.should_resume()
    }

    pub fn is_identified(&self) -> bool {
        self.session.is_identified()
    }

    pub fn hello_received(&self) -> bool {
        self.session.hello_received()
    }

    /// Round trip of the last acknowledged heartbeat on this connection
    pub fn heartbeat_latency(&self) -> Option<Duration> {
        self.heartbeat.lock().as_ref().and_then(|monitor| monitor.latency())
    }

    pub fn identify_lock(&self) -> &IdentifyLock {
        &self.identify_lock
    }
}

#[async_trait]
impl HeartbeatTarget for Shard {
    async fn send_heartbeat(&self) -> Result<(), GatewayError> {
        self.heartbeat().await
    }

    async fn heartbeat_missed(&self) {
        self.heartbeat_missed.store(true, Ordering::SeqCst);
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

/// Read and decode frames into the consumer queue. Heartbeat acks after
/// Hello go straight to the monitor, so they are applied even while the
/// consumer is parked on the identify lock.
async fn read_loop(shard: Arc<Shard>, queue: mpsc::Sender<Payload>) -> Result<(), GatewayError> {
    loop {
        let frame = shard.transport.read().await?;
        let payload = Payload::from_slice(&frame)?;
        shard.record_frame(&payload);

        if payload.opcode() == Some(OpCode::HeartbeatAck) && shard.session.hello_received() {
            shard.heartbeat_ack();
            continue;
        }
        if queue.send(payload).await.is_err() {
            return Ok(());
        }
    }
}

/// Whether the next connect should resume, given why the last one ended.
/// None leaves the decision made by a packet processor in place.
fn resumable_after(err: &GatewayError) -> Option<bool> {
    match err {
        GatewayError::ReconnectRequested { .. } | GatewayError::SessionInvalidated { .. } => None,
        GatewayError::Closed { code: Some(code), .. } if SESSION_LOST_CLOSE_CODES.contains(code) => {
            Some(false)
        }
        GatewayError::Closed { .. } if err.is_rejected_close() => Some(false),
        GatewayError::Decode(_)
        | GatewayError::ProtocolViolation { .. }
        | GatewayError::ProcessorPanicked { .. } => Some(false),
        _ => Some(true),
    }
}

/// Append the protocol version and encoding to a URL without a query
fn with_query(url: &str) -> String {
    if url.contains('?') {
        return url.to_string();
    }
    format!("{}/?v={API_VERSION}&encoding=json", url.trim_end_matches('/'))
}

fn closed_by_owner() -> GatewayError {
    GatewayError::Closed {
        code: None,
        reason: "closed by owner".to_string(),
    }
}

/// Builder for a [`Shard`]; every setting besides the shard pair and token
/// is optional.
#[must_use = "builders have no effect until built"]
pub struct ShardBuilder {
    id: ShardId,
    config: ShardConfig,
    transport: Option<Arc<dyn Transport>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    identify_lock: Option<IdentifyLock>,
    registry: Option<ShardState>,
}

impl ShardBuilder {
    pub fn new(id: ShardId, token: impl Into<String>) -> Self {
        Self::with_config(id, ShardConfig::new(token))
    }

    pub fn with_config(id: ShardId, config: ShardConfig) -> Self {
        Self {
            id,
            config,
            transport: None,
            dispatcher: None,
            identify_lock: None,
            registry: None,
        }
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.config.intents = intents;
        self
    }

    pub fn presence(mut self, presence: UpdatePresencePayload) -> Self {
        self.config.presence = Some(presence);
        self
    }

    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.config.gateway_url = url.into();
        self
    }

    /// Add a header to the connection upgrade request
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn properties(mut self, properties: IdentifyProperties) -> Self {
        self.config.properties = properties;
        self
    }

    pub fn large_threshold(mut self, large_threshold: u64) -> Self {
        self.config.large_threshold = large_threshold;
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.config.compress = compress;
        self
    }

    pub fn send_quota(mut self, quota: SendQuota) -> Self {
        self.config.send_quota = quota;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.frame_queue_capacity = capacity;
        self
    }

    pub fn dispatch_concurrency(mut self, limit: usize) -> Self {
        self.config.dispatch_concurrency = limit;
        self
    }

    pub fn dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatch_timeout = timeout;
        self
    }

    /// Share an identify lock with other shards; a private one is created otherwise
    pub fn identify_lock(mut self, lock: IdentifyLock) -> Self {
        self.identify_lock = Some(lock);
        self
    }

    /// Transport to drive; defaults to a TLS WebSocket
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where dispatch events go; events are dropped when unset
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Registry to mirror phase and counters into
    pub fn state(mut self, registry: ShardState) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Arc<Shard> {
        let (closed, _) = watch::channel(false);

        Arc::new(Shard {
            id: self.id,
            limiter: SendLimiter::new(self.config.send_quota),
            dispatch_slots: Arc::new(Semaphore::new(self.config.dispatch_concurrency.max(1))),
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(WebSocketTransport::new())),
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(HandlerTable::new())),
            identify_lock: self.identify_lock.unwrap_or_default(),
            session: SessionState::default(),
            heartbeat: Mutex::new(None),
            phase: AtomicU8::new(ShardPhase::Disconnected as u8),
            closed,
            heartbeat_missed: AtomicBool::new(false),
            registry: self.registry,
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_is_appended_once() {
        assert_eq!(
            with_query("wss://gateway.discord.gg"),
            "wss://gateway.discord.gg/?v=10&encoding=json"
        );
        assert_eq!(with_query("wss://x/"), "wss://x/?v=10&encoding=json");
        assert_eq!(with_query("wss://x/?v=9"), "wss://x/?v=9");
    }

    #[test]
    fn resume_policy_follows_close_reason() {
        let closed = |code| GatewayError::Closed { code, reason: String::new() };

        assert_eq!(resumable_after(&closed(Some(1001))), Some(true));
        assert_eq!(resumable_after(&closed(None)), Some(true));
        assert_eq!(resumable_after(&closed(Some(4009))), Some(false));
        assert_eq!(resumable_after(&closed(Some(4004))), Some(false));
        assert_eq!(resumable_after(&GatewayError::HeartbeatMissed { shard_id: 0 }), Some(true));
        assert_eq!(
            resumable_after(&GatewayError::ProtocolViolation { shard_id: 0, op: 0 }),
            Some(false)
        );
        assert_eq!(resumable_after(&GatewayError::ReconnectRequested { shard_id: 0 }), None);
    }

    #[tokio::test]
    async fn builder_applies_settings() {
        let lock = IdentifyLock::new(Duration::from_secs(1));
        let shard = Shard::builder(ShardId::new(2, 4), "token")
            .intents(Intents::GUILDS)
            .gateway_url("wss://gateway.test")
            .identify_lock(lock.clone())
            .build();

        assert_eq!(shard.id(), ShardId::new(2, 4));
        assert_eq!(shard.phase(), ShardPhase::Disconnected);
        assert_eq!(shard.config.intents, Intents::GUILDS);
        assert_eq!(shard.config.gateway_url, "wss://gateway.test");
        assert!(shard.identify_lock().same_lock(&lock));
        assert_eq!(shard.session_id(), None);
        assert_eq!(shard.last_sequence(), 0);
    }
}
