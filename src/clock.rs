//! Time sources for the checkpoint runtime

use std::cell::Cell;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Wall-clock time in microseconds since the Unix epoch. Names run directories.
    fn epoch_micros(&self) -> Option<u64>;
    /// Time elapsed on a monotonic clock. Only differences are meaningful.
    fn monotonic(&self) -> Option<Duration>;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn epoch_micros(&self) -> Option<u64> {
        let since = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        u64::try_from(since.as_micros()).ok()
    }

    fn monotonic(&self) -> Option<Duration> {
        Some(self.start.elapsed())
    }
}

/// A clock that only moves when told to. Every epoch reading returns a distinct, increasing
/// value, so consecutive runs get distinct run directories.
#[derive(Debug, Default)]
pub struct ManualClock {
    epoch: Cell<u64>,
    now: Cell<Duration>,
    broken: Cell<bool>,
}

impl ManualClock {
    pub fn new(epoch_micros: u64) -> Self {
        Self {
            epoch: Cell::new(epoch_micros),
            ..Default::default()
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    /// Make every later reading fail
    pub fn break_clock(&self) {
        self.broken.set(true);
    }
}

impl Clock for ManualClock {
    fn epoch_micros(&self) -> Option<u64> {
        if self.broken.get() {
            return None;
        }
        let e = self.epoch.get();
        self.epoch.set(e + 1);
        Some(e)
    }

    fn monotonic(&self) -> Option<Duration> {
        if self.broken.get() {
            None
        } else {
            Some(self.now.get())
        }
    }
}
