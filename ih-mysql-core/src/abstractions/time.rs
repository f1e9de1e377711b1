//! Time abstractions for testability
//!
//! Polling loops (replication catch-up, SSM invocation status, lock
//! acquisition) and the replication-status cache read time through [`Clock`]
//! so they can be driven deterministically by [`MockClock`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Instant in time (monotonic clock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64); // Microseconds since the clock's epoch

impl Instant {
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Duration since another instant, zero if `earlier` is later
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }

    pub fn checked_add(&self, duration: Duration) -> Option<Instant> {
        u64::try_from(duration.as_micros())
            .ok()
            .and_then(|micros| self.0.checked_add(micros))
            .map(Instant)
    }

    /// Saturating addition, used for deadlines
    pub fn saturating_add(&self, duration: Duration) -> Instant {
        self.checked_add(duration).unwrap_or(Instant(u64::MAX))
    }
}

/// Abstraction for time operations
#[async_trait]
pub trait Clock: Send + Sync {
    /// Get current instant (monotonic)
    fn now(&self) -> Instant;

    /// Get current wall-clock time
    fn system_time(&self) -> SystemTime;

    async fn sleep(&self, duration: Duration);
}

/// Production clock
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        let micros = self.origin.elapsed().as_micros();
        Instant::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Mock clock for deterministic testing
///
/// `sleep` returns immediately after advancing the clock by the requested
/// duration and recording it, so a polling loop runs to completion in zero
/// real time while observing the elapsed time it asked for.
#[derive(Clone)]
pub struct MockClock {
    current_micros: Arc<Mutex<u64>>,
    /// Wall-clock time at micros == 0
    epoch: SystemTime,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl MockClock {
    /// Create new mock clock starting at zero
    pub fn new() -> Self {
        Self::with_epoch(UNIX_EPOCH)
    }

    /// Create a mock clock whose wall-clock time starts at `epoch`
    pub fn with_epoch(epoch: SystemTime) -> Self {
        Self {
            current_micros: Arc::new(Mutex::new(0)),
            epoch,
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advance time without recording a sleep
    pub fn advance(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let mut current = self.current_micros.lock();
        *current = current.saturating_add(micros);
    }

    /// Durations passed to `sleep` so far
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    /// Total time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(*self.current_micros.lock())
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> Instant {
        Instant::from_micros(*self.current_micros.lock())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
