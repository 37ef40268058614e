//! Delta-based speed and ETA estimation.
//!
//! Speed is measured between the two most recent engine callbacks rather than
//! averaged from the start, so it reacts to throttling and resumes. The result
//! is noisy by nature; [`crate::smoothing`] takes care of the display side.

use std::time::Instant;

use crate::format::BYTES_PER_MB;

/// Result of feeding one engine sample to a [`RateTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateUpdate {
    /// Bytes received since the previous sample.
    pub delta_bytes: u64,
    /// Instantaneous speed in bytes per second, if measurable.
    pub speed_bps: Option<f64>,
    /// Seconds remaining, if both speed and total are known.
    pub eta_secs: Option<i64>,
    /// Percent complete (0 - 100).
    pub percent: f64,
}

impl RateUpdate {
    /// Speed in MB/s, zero when unknown.
    #[must_use]
    pub fn speed_mbps(&self) -> f64 {
        self.speed_bps.map_or(0.0, |bps| bps / BYTES_PER_MB)
    }
}

/// Tracks the previous sample of one download.
#[derive(Debug, Clone, Default)]
pub struct RateTracker {
    last: Option<(Instant, u64)>,
}

impl RateTracker {
    /// Creates a tracker with no history.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Records a sample taken now.
    pub fn observe(&mut self, downloaded: u64, total: u64) -> RateUpdate {
        self.observe_at(downloaded, total, Instant::now())
    }

    /// Records a sample taken at `now`.
    pub fn observe_at(&mut self, downloaded: u64, total: u64, now: Instant) -> RateUpdate {
        let (delta_bytes, speed_bps) = match self.last {
            Some((prev_time, prev_bytes)) => {
                let delta = downloaded.saturating_sub(prev_bytes);
                let elapsed = now.saturating_duration_since(prev_time).as_secs_f64();
                let speed = (elapsed > 0.0 && delta > 0).then(|| delta as f64 / elapsed);
                (delta, speed)
            }
            None => (downloaded, None),
        };
        self.last = Some((now, downloaded));

        let eta_secs = match speed_bps {
            Some(bps) if total > downloaded => Some(((total - downloaded) as f64 / bps) as i64),
            _ => None,
        };

        RateUpdate {
            delta_bytes,
            speed_bps,
            eta_secs,
            percent: estimate_percent(downloaded, total),
        }
    }

    /// Forgets the previous sample.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Percent complete from byte counts.
///
/// With an unknown total, every downloaded megabyte counts as one percent,
/// capped at 99 so the task never looks finished before the engine says so.
#[must_use]
pub fn estimate_percent(downloaded: u64, total: u64) -> f64 {
    if total > 0 {
        (downloaded as f64 / total as f64 * 100.0).min(100.0)
    } else if downloaded > 0 {
        (downloaded as f64 / BYTES_PER_MB).min(99.0)
    } else {
        0.0
    }
}
