//! Hardware frame number reconstruction from sensor timestamps
//!
//! The count is a heuristic: it assumes the frame duration changes slower
//! than it can be observed, so a gap of N expected intervals means N - 1
//! frames never reached us.

use std::time::Duration;

/// Per-frame timing inputs as reported by the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingSample {
    pub sensor_timestamp_ns: Option<u64>,
    pub frame_duration_ns: Option<u64>,
    pub monotonic: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingUpdate {
    pub hardware_frame_number: u64,
    pub dropped_since_last: u64,
    pub fps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clock {
    Sensor,
    Monotonic,
}

#[derive(Debug, Clone)]
pub struct FrameTimingTracker {
    nominal_interval_ns: Option<u64>,
    expected_interval_ns: Option<u64>,
    last: Option<(Clock, u64)>,
    hardware_frame_number: u64,
    total_dropped: u64,
    fps: f64,
}

const FPS_SMOOTHING: f64 = 0.1;

impl FrameTimingTracker {
    /// `nominal_fps` stands in for the interval when the driver never reports one.
    pub fn new(nominal_fps: f64) -> Self {
        let nominal_interval_ns =
            (nominal_fps.is_finite() && nominal_fps > 0.0).then(|| (1e9 / nominal_fps).round() as u64);
        Self {
            nominal_interval_ns,
            expected_interval_ns: None,
            last: None,
            hardware_frame_number: 0,
            total_dropped: 0,
            fps: nominal_interval_ns.map(|i| 1e9 / i as f64).unwrap_or(0.0),
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    pub fn expected_interval_ns(&self) -> Option<u64> {
        self.expected_interval_ns.or(self.nominal_interval_ns)
    }

    pub fn update(&mut self, sample: TimingSample) -> TimingUpdate {
        if let Some(duration) = sample.frame_duration_ns.filter(|d| *d > 0) {
            self.expected_interval_ns = Some(duration);
        }

        let (clock, ts) = match sample.sensor_timestamp_ns {
            Some(ts) => (Clock::Sensor, ts),
            None => (
                Clock::Monotonic,
                u64::try_from(sample.monotonic.as_nanos()).unwrap_or(u64::MAX),
            ),
        };

        let mut dropped = 0;
        match self.last {
            Some((last_clock, last_ts)) if last_clock == clock && ts > last_ts => {
                let delta = ts - last_ts;
                let elapsed = match self.expected_interval_ns() {
                    Some(interval) => ((delta as f64 / interval as f64).round() as u64).max(1),
                    None => 1,
                };
                dropped = elapsed - 1;
                self.hardware_frame_number += elapsed;
                self.total_dropped += dropped;

                let observed = 1e9 * elapsed as f64 / delta as f64;
                self.fps = if self.fps > 0.0 {
                    self.fps + FPS_SMOOTHING * (observed - self.fps)
                } else {
                    observed
                };
            }
            // Clock source switched or went backwards: count one slot, rebase
            Some(_) => self.hardware_frame_number += 1,
            None => {}
        }
        self.last = Some((clock, ts));

        TimingUpdate {
            hardware_frame_number: self.hardware_frame_number,
            dropped_since_last: dropped,
            fps: self.fps,
        }
    }
}
