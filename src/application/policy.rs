//! Timing policies shared by the producer and the consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use rand::Rng;

use crate::domain::errors::{StoreError, TransportError};
use crate::errors::{OutboxError, OutboxResult};

/// Exponential reconnect backoff: `min(2^attempt + U(0, 1), ceiling)` seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(3600),
        }
    }
}

impl Backoff {
    pub fn new(ceiling: Duration) -> Self {
        Self { ceiling }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(attempt, jitter)
    }

    fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let ceiling = self.ceiling.as_secs_f64();
        // 2^attempt overflows to infinity long before i32::MAX; min() handles it.
        let seconds = (2f64.powi(attempt.min(i32::MAX as u32) as i32) + jitter).min(ceiling);
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// Bounded retry for a single send.
///
/// The third consecutive failure pauses for `pause_for_retry`, every later
/// failure waits `wait_retry`. No pause follows the final failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause_for_retry: Duration,
    pub wait_retry: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            pause_for_retry: Duration::from_secs(240),
            wait_retry: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Pause after the `failures`-th consecutive failure.
    pub fn pause_after(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        match failures {
            0..=2 => None,
            3 => Some(self.pause_for_retry),
            _ => Some(self.wait_retry),
        }
    }

    /// Run `attempt` until it succeeds or `max_attempts` is used up.
    ///
    /// Returns how many attempts failed before the successful one.
    pub fn run<F>(&self, attempt: F) -> OutboxResult<u32>
    where
        F: FnMut() -> Result<(), TransportError>,
    {
        self.run_until(&AtomicBool::new(false), attempt)
    }

    /// Like [`RetryPolicy::run`], but a failure seen after `cancel` is set
    /// ends the loop with that failure instead of waiting for the next try.
    pub fn run_until<F>(&self, cancel: &AtomicBool, mut attempt: F) -> OutboxResult<u32>
    where
        F: FnMut() -> Result<(), TransportError>,
    {
        let mut failures = 0;
        while failures < self.max_attempts {
            match attempt() {
                Ok(()) => return Ok(failures),
                Err(e) => {
                    failures += 1;
                    warn!(
                        "Send attempt {}/{} failed: {}",
                        failures, self.max_attempts, e
                    );
                    if cancel.load(Ordering::SeqCst) {
                        return Err(OutboxError::Transport(e));
                    }
                    if let Some(pause) = self.pause_after(failures) {
                        if !pause.is_zero() {
                            debug!("Waiting {:?} before the next send attempt", pause);
                            if !sleep_unless(cancel, pause) {
                                return Err(OutboxError::Transport(e));
                            }
                        }
                    }
                }
            }
        }
        Err(OutboxError::ExceededSendAttempts { attempts: failures })
    }
}

/// Poll wait that stretches while the outbox stays empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdleBackoff {
    pub base: Duration,
}

impl IdleBackoff {
    pub fn wait_for(&self, empty_polls: u32) -> Duration {
        let factor = match empty_polls {
            0..=2 => 1,
            3..=9 => 3,
            10..=29 => 5,
            _ => 10,
        };
        self.base * factor
    }
}

/// Oldest `added` timestamp that survives a prune with `days` of retention.
///
/// Anything whose age in whole days exceeds `days` goes, so the cutoff is
/// `days + 1` whole days back.
pub fn retention_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    now - chrono::Duration::days(days + 1)
}

/// Throttle for the old-record sweep: after a successful prune the gate
/// stays closed for `ttl`.
#[derive(Debug)]
pub struct PruneGate {
    ttl: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl PruneGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            last_run: Mutex::new(None),
        }
    }

    pub fn is_open(&self) -> bool {
        match self.last_run.lock() {
            Ok(last) => last.map_or(true, |at| at.elapsed() >= self.ttl),
            Err(_) => true,
        }
    }

    /// Run `prune` unless the gate is closed. Returns the number of deleted
    /// records, or `None` when the sweep was skipped or failed.
    pub fn run<F>(&self, what: &str, prune: F) -> Option<usize>
    where
        F: FnOnce() -> Result<usize, StoreError>,
    {
        if !self.is_open() {
            return None;
        }
        match prune() {
            Ok(deleted) => {
                if let Ok(mut last) = self.last_run.lock() {
                    *last = Some(Instant::now());
                }
                debug!("Removed {} old {} records", deleted, what);
                Some(deleted)
            }
            Err(e) => {
                warn!("Could not remove old {} records: {}", what, e);
                None
            }
        }
    }
}

/// Sleep for `total` in short slices, returning early once `stop` is set.
/// Returns `false` if the sleep was cut short.
pub fn sleep_unless(stop: &AtomicBool, total: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(slice.min(deadline - now));
    }
}
