use std::time::{Duration, Instant};

/// Shortest window a frequency may be computed over.
pub const MIN_WINDOW: Duration = Duration::from_millis(1000);

/// Counts arrivals and reports a frequency once per completed window.
#[derive(Debug, Clone)]
pub struct RateMonitor {
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl RateMonitor {
    pub fn new(now: Instant) -> Self {
        Self::with_window(now, MIN_WINDOW)
    }

    /// Windows shorter than [`MIN_WINDOW`] are clamped up.
    pub fn with_window(now: Instant, window: Duration) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            window_start: now,
            count: 0,
        }
    }

    pub fn record_sample(&mut self, _now: Instant) {
        self.count = self.count.saturating_add(1);
    }

    /// Returns the frequency in Hz if the current window has elapsed, then
    /// starts a new window at `now`.
    pub fn maybe_flush(&mut self, now: Instant) -> Option<f32> {
        let elapsed = now.checked_duration_since(self.window_start)?;
        if elapsed < self.window {
            return None;
        }
        let frequency = self.count as f32 / elapsed.as_secs_f32();
        self.reset(now);
        Some(frequency)
    }

    pub fn reset(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = now;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
