//! Per-shard session state
//!
//! Touched concurrently by the consumer loop, the heartbeat timer and
//! external callers. Flags and the sequence watermark are atomics; the two
//! strings share one small lock that is never held across an await.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct SessionIds {
    session_id: Option<String>,
    resume_url: Option<String>,
}

#[derive(Debug, Default)]
pub struct SessionState {
    ids: RwLock<SessionIds>,
    last_sequence: AtomicU64,
    is_identified: AtomicBool,
    hello_received: AtomicBool,
    should_resume: AtomicBool,
}

impl SessionState {
    /// Raise the watermark to `seq` if it is higher; never lowers it.
    /// Returns the watermark after the update.
    pub fn observe_sequence(&self, seq: u64) -> u64 {
        self.last_sequence.fetch_max(seq, Ordering::SeqCst).max(seq)
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Sequence to echo in heartbeats; None until one has been seen
    pub fn heartbeat_sequence(&self) -> Option<u64> {
        Some(self.last_sequence()).filter(|seq| *seq > 0)
    }

    /// Store identity from the session-ready event
    pub fn set_session(&self, session_id: String, resume_url: Option<String>) {
        let mut ids = self.ids.write();
        ids.session_id = Some(session_id);
        ids.resume_url = resume_url;
    }

    pub fn session_id(&self) -> Option<String> {
        self.ids.read().session_id.clone()
    }

    pub fn resume_url(&self) -> Option<String> {
        self.ids.read().resume_url.clone()
    }

    /// A resume is attempted only when asked for and a session exists
    pub fn can_resume(&self) -> bool {
        self.should_resume()
            && self
                .ids
                .read()
                .session_id
                .as_deref()
                .is_some_and(|id| !id.is_empty())
    }

    /// Forget the previous session before a fresh identify
    pub fn reset(&self) {
        *self.ids.write() = SessionIds::default();
        self.last_sequence.store(0, Ordering::SeqCst);
        self.should_resume.store(false, Ordering::SeqCst);
    }

    /// Clear per-connection handshake flags
    pub fn begin_connection(&self) {
        self.hello_received.store(false, Ordering::SeqCst);
        self.is_identified.store(false, Ordering::SeqCst);
    }

    pub fn should_resume(&self) -> bool {
        self.should_resume.load(Ordering::SeqCst)
    }

    pub fn set_should_resume(&self, resume: bool) {
        self.should_resume.store(resume, Ordering::SeqCst);
    }

    pub fn hello_received(&self) -> bool {
        self.hello_received.load(Ordering::SeqCst)
    }

    pub fn set_hello_received(&self) {
        self.hello_received.store(true, Ordering::SeqCst);
    }

    pub fn is_identified(&self) -> bool {
        self.is_identified.load(Ordering::SeqCst)
    }

    pub fn set_identified(&self) {
        self.is_identified.store(true, Ordering::SeqCst);
    }
}
