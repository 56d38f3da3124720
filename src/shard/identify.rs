//! Identify lock
//!
//! The platform limits how often one process may start new sessions. A
//! single `IdentifyLock` is constructed per cluster and cloned into each of
//! its shards: only one shard may be inside its identify step at a time, and
//! the lock stays held for a fixed cooldown after the holder releases it.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Cooldown between session starts required by the platform
pub const DEFAULT_IDENTIFY_COOLDOWN: Duration = Duration::from_secs(5);

/// Shared identify capability; clones refer to the same lock
#[derive(Debug, Clone)]
pub struct IdentifyLock {
    inner: Arc<Mutex<()>>,
    cooldown: Duration,
}

impl IdentifyLock {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(())),
            cooldown,
        }
    }

    /// Wait for exclusive use of the identify step
    pub async fn acquire(&self) -> IdentifyPermit {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        trace!("Identify lock acquired");
        IdentifyPermit {
            guard: Some(guard),
            cooldown: self.cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether two handles share one lock
    pub fn same_lock(&self, other: &IdentifyLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for IdentifyLock {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFY_COOLDOWN)
    }
}

/// Exclusive right to identify. Dropping it starts the cooldown, after which
/// the lock is released to the next waiter.
#[derive(Debug)]
pub struct IdentifyPermit {
    guard: Option<OwnedMutexGuard<()>>,
    cooldown: Duration,
}

impl Drop for IdentifyPermit {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let cooldown = self.cooldown;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    drop(guard);
                    trace!("Identify lock released");
                });
            }
            // no runtime left to time the cooldown
            Err(_) => drop(guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn lock_is_held_through_cooldown() {
        let lock = IdentifyLock::new(Duration::from_secs(5));

        let released_at = {
            let _permit = lock.acquire().await;
            Instant::now()
        };

        let _second = lock.acquire().await;
        assert!(Instant::now() - released_at >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn clones_share_the_lock() {
        let lock = IdentifyLock::new(Duration::from_secs(1));
        let clone = lock.clone();
        assert!(lock.same_lock(&clone));
        assert!(!lock.same_lock(&IdentifyLock::default()));

        let permit = lock.acquire().await;
        let waiting = tokio::spawn(async move {
            let _permit = clone.acquire().await;
            Instant::now()
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiting.is_finished());

        let released_at = Instant::now();
        drop(permit);
        let acquired_at = waiting.await.unwrap();
        assert!(acquired_at - released_at >= Duration::from_secs(1));
    }
}
