//! Connect backoff
//!
//! Exponential backoff with jitter and a cap on total elapsed time. Each
//! failed connect attempt asks for the next step; once the elapsed budget is
//! spent the schedule moves to the terminal `Exhausted` step and stays there.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Shape of the retry schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Total time across attempts after which connecting is abandoned
    pub max_elapsed: Duration,
    /// Fraction of each interval randomly added or removed (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(180),
            jitter: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// Start a fresh schedule; elapsed time is measured from now
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            current: self.initial_interval,
            started: Instant::now(),
            attempts: 0,
            exhausted: false,
        }
    }
}

/// Outcome of one failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Wait this long, then try again
    Retry(Duration),
    /// Budget spent; stop retrying
    Exhausted { attempts: u32, elapsed: Duration },
}

/// A running retry schedule
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    started: Instant,
    attempts: u32,
    exhausted: bool,
}

impl Backoff {
    /// Record a failed attempt and decide what happens next
    pub fn next_step(&mut self) -> BackoffStep {
        self.attempts = self.attempts.saturating_add(1);
        let elapsed = self.started.elapsed();

        if self.exhausted || elapsed >= self.policy.max_elapsed {
            return self.exhaust(elapsed);
        }

        let delay = self.jittered(self.current);
        self.current = self
            .current
            .mul_f64(self.policy.multiplier)
            .min(self.policy.max_interval);

        if elapsed + delay > self.policy.max_elapsed {
            return self.exhaust(elapsed);
        }
        BackoffStep::Retry(delay)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn exhaust(&mut self, elapsed: Duration) -> BackoffStep {
        self.exhausted = true;
        BackoffStep::Exhausted {
            attempts: self.attempts,
            elapsed,
        }
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return interval;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        interval.mul_f64(factor)
    }
}
