//! Debounced byte-level progress tracking for a single run.
//!
//! Copy loops feed the tracker raw chunk sizes; it converts them to a rounded
//! whole percentage and invokes its callback only when the value is worth
//! broadcasting. Progress lives in memory and on the event bus, the durable
//! status file only sees it at snapshot points.

use std::time::{Duration, Instant};

/// Observers are not re-notified within this window unless the whole
/// percentage actually changed.
pub const NOTIFY_MIN_INTERVAL: Duration = Duration::from_millis(50);

pub struct ByteProgressTracker {
    total_bytes: u64,
    copied_bytes: u64,
    last_percent: u8,
    last_notify: Instant,
    min_interval: Duration,
    on_change: Box<dyn FnMut(u8) + Send + Sync>,
}

impl ByteProgressTracker {
    /// Creates a tracker for a run expected to copy `total_bytes` and
    /// immediately reports 0% through the callback.
    pub fn new(total_bytes: u64, on_change: impl FnMut(u8) + Send + Sync + 'static) -> Self {
        let mut tracker = Self {
            total_bytes: 0,
            copied_bytes: 0,
            last_percent: 0,
            last_notify: Instant::now(),
            min_interval: NOTIFY_MIN_INTERVAL,
            on_change: Box::new(on_change),
        };
        tracker.reset(total_bytes);
        tracker
    }

    /// Zeroes the byte count for a new run and immediately reports 0%.
    pub fn reset(&mut self, total_bytes: u64) {
        self.total_bytes = total_bytes;
        self.copied_bytes = 0;
        self.last_percent = 0;
        self.last_notify = Instant::now();
        (self.on_change)(0);
    }

    /// Records `count` freshly copied bytes and notifies if the percentage
    /// changed or the rate-limit window has elapsed.
    pub fn add_copied_bytes(&mut self, count: u64) {
        self.copied_bytes = self.copied_bytes.saturating_add(count);
        let percent = self.percent();
        let interval_elapsed = self.last_notify.elapsed() >= self.min_interval;
        if percent != self.last_percent || interval_elapsed {
            self.last_percent = percent;
            self.last_notify = Instant::now();
            (self.on_change)(percent);
        }
    }

    /// Current completion as a rounded whole percentage, clamped to 100.
    ///
    /// A run expected to copy zero bytes reports 0 until the caller marks it
    /// complete.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 0;
        }
        let rounded =
            (self.copied_bytes.saturating_mul(100) + self.total_bytes / 2) / self.total_bytes;
        rounded.min(100) as u8
    }

    pub fn copied_bytes(&self) -> u64 {
        self.copied_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[cfg(test)]
    fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }
}
