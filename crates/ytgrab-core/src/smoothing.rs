//! Time-windowed smoothing of progress samples.
//!
//! Engines call back many times per second with jittery speeds. Each task
//! buffers its samples in a [`SmoothingState`]; once per window the download
//! service publishes the mean and clears the buffer.

use std::collections::VecDeque;

use crate::format::format_speed_mbps;

/// Number of samples kept per window. Older samples are dropped first.
pub const SMOOTHING_CAPACITY: usize = 10;

/// Default length of one smoothing window in milliseconds.
pub const DEFAULT_SMOOTHING_WINDOW_MS: u64 = 1000;

/// One raw progress observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Instantaneous speed in MB/s. Zero or negative means unknown.
    pub speed_mbps: f64,
    /// Percent complete (0 - 100).
    pub percent: f64,
}

/// Bounded ring of recent measurements for one task.
#[derive(Debug, Clone)]
pub struct SmoothingState {
    samples: VecDeque<Measurement>,
}

impl Default for SmoothingState {
    fn default() -> Self {
        Self::new()
    }
}

impl SmoothingState {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SMOOTHING_CAPACITY),
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn add_measurement(&mut self, speed_mbps: f64, percent: f64) {
        if self.samples.len() == SMOOTHING_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(Measurement {
            speed_mbps,
            percent,
        });
    }

    /// Mean speed (formatted) and mean percent of the buffered samples.
    ///
    /// The speed averages only samples with a positive speed and is empty
    /// when there are none. An empty buffer yields `("", 0)`.
    #[must_use]
    pub fn calculate_smoothed_values(&self) -> (String, u8) {
        if self.samples.is_empty() {
            return (String::new(), 0);
        }

        let (speed_sum, speed_count) = self
            .samples
            .iter()
            .filter(|m| m.speed_mbps > 0.0)
            .fold((0.0, 0usize), |(sum, n), m| (sum + m.speed_mbps, n + 1));
        let speed = if speed_count > 0 {
            format_speed_mbps(speed_sum / speed_count as f64)
        } else {
            String::new()
        };

        let percent_sum: f64 = self.samples.iter().map(|m| m.percent).sum();
        let percent = (percent_sum / self.samples.len() as f64)
            .round()
            .clamp(0.0, 100.0) as u8;

        (speed, percent)
    }

    /// Empties the buffer, keeping its allocation.
    pub fn clear_measurements(&mut self) {
        self.samples.clear();
    }

    /// Number of buffered samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoothed_values() {
        let mut state = SmoothingState::new();
        state.add_measurement(1.5, 25.0);
        state.add_measurement(2.0, 30.0);
        state.add_measurement(1.8, 35.0);

        let (speed, percent) = state.calculate_smoothed_values();
        assert_eq!(speed, "1.8MB/s");
        assert_eq!(percent, 30);
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut state = SmoothingState::new();
        state.add_measurement(1.0, 10.0);
        state.clear_measurements();
        assert!(state.is_empty());
        assert_eq!(state.calculate_smoothed_values(), (String::new(), 0));
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut state = SmoothingState::new();
        state.add_measurement(100.0, 0.0);
        for _ in 0..SMOOTHING_CAPACITY {
            state.add_measurement(1.0, 50.0);
        }
        assert_eq!(state.len(), SMOOTHING_CAPACITY);
        assert_eq!(
            state.calculate_smoothed_values(),
            ("1.0MB/s".to_string(), 50)
        );
    }

    #[test]
    fn test_unknown_speeds_are_ignored() {
        let mut state = SmoothingState::new();
        state.add_measurement(0.0, 10.0);
        state.add_measurement(2.0, 20.0);
        assert_eq!(
            state.calculate_smoothed_values(),
            ("2.0MB/s".to_string(), 15)
        );

        state.clear_measurements();
        state.add_measurement(0.0, 40.0);
        assert_eq!(state.calculate_smoothed_values(), (String::new(), 40));
    }
}
