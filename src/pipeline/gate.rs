//! Wall-clock rate limiter

use std::time::Duration;

const EARLY_TOLERANCE_DIVISOR: u32 = 20;

/// Decides whether a frame observed at a monotonic timestamp may be emitted.
///
/// Owned by a single task; no locking.
#[derive(Debug, Clone, Default)]
pub struct FrameGate {
    interval: Option<Duration>,
    last_emit: Option<Duration>,
}

impl FrameGate {
    pub fn new(interval_seconds: f64) -> Self {
        let mut gate = Self::default();
        gate.configure(interval_seconds);
        gate
    }

    /// Gate that emits at most `fps` times per second; `fps <= 0` is unlimited.
    pub fn from_fps(fps: f64) -> Self {
        Self::new(fps_to_interval(fps))
    }

    /// Set the minimum spacing. Zero, negative or non-finite means unlimited.
    ///
    /// The next `should_emit` after a reconfigure always passes.
    pub fn configure(&mut self, interval_seconds: f64) {
        self.interval = (interval_seconds.is_finite() && interval_seconds > 0.0)
            .then(|| Duration::try_from_secs_f64(interval_seconds).unwrap_or(Duration::MAX));
        self.last_emit = None;
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Frames arriving up to 5% of the interval early still pass, so a
    /// 30 fps stream capped at 10 fps keeps every third frame instead of
    /// sliding to every fourth on rounding and jitter.
    pub fn should_emit(&mut self, now: Duration) -> bool {
        let Some(interval) = self.interval else {
            return true;
        };
        let tolerance = interval / EARLY_TOLERANCE_DIVISOR;
        match self.last_emit {
            Some(last) if now.saturating_sub(last).saturating_add(tolerance) < interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

pub fn fps_to_interval(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        1.0 / fps
    } else {
        0.0
    }
}
