//! Rolling environmental feature window
//!
//! Keeps the most recent samples of motion, sound and CO2 in bounded FIFO
//! buffers and periodically reduces them to rate/average features. Sample
//! arrival and tick cadence are independent: pushes evict by count, ticks
//! fire by elapsed time.

use crate::domain::types::{AggregatedFeatures, EnvironmentSample};
use std::collections::VecDeque;
use tracing::trace;

/// Window sizing and tick cadence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationParams {
    /// Span of history kept (seconds at the nominal sample rate)
    pub window_secs: u64,
    /// Nominal sensor sample rate, used to turn the span into a capacity
    pub sample_rate_hz: f64,
    /// Minimum time between successful ticks (seconds)
    pub interval_secs: u64,
    /// Minimum buffered samples before a tick may produce features
    pub min_samples: usize,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self { window_secs: 300, sample_rate_hz: 1.0, interval_secs: 10, min_samples: 10 }
    }
}

impl AggregationParams {
    /// Ring capacity in samples
    pub fn capacity(&self) -> usize {
        ((self.window_secs as f64 * self.sample_rate_hz).round() as usize).max(1)
    }
}

/// Fixed-capacity FIFO buffer; pushing into a full buffer evicts the oldest value
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append a value, returning the evicted one if the buffer was full
    pub fn push(&mut self, value: T) -> Option<T> {
        let evicted = if self.items.len() >= self.capacity { self.items.pop_front() } else { None };
        self.items.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Parallel motion/sound/CO2 buffers, always the same length
#[derive(Debug, Clone)]
pub struct FeatureWindow {
    motion: RingBuffer<bool>,
    sound: RingBuffer<f64>,
    co2: RingBuffer<f64>,
}

impl FeatureWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            motion: RingBuffer::new(capacity),
            sound: RingBuffer::new(capacity),
            co2: RingBuffer::new(capacity),
        }
    }

    pub fn push(&mut self, sample: &EnvironmentSample) {
        self.motion.push(sample.motion_active);
        self.sound.push(sample.sound_level_db);
        self.co2.push(sample.co2_ppm);
    }

    pub fn len(&self) -> usize {
        self.motion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motion.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.motion.capacity()
    }

    fn mean(values: &RingBuffer<f64>) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }

    /// Reduce the buffers to features; None when empty
    pub fn reduce(&self, timestamp_ms: u64) -> Option<AggregatedFeatures> {
        if self.is_empty() {
            return None;
        }
        let active = self.motion.iter().filter(|&&m| m).count();
        Some(AggregatedFeatures {
            motion_rate: active as f64 / self.len() as f64,
            avg_sound: Self::mean(&self.sound),
            avg_co2: Self::mean(&self.co2),
            timestamp_ms,
        })
    }
}

/// Periodic reducer over a doorway's environmental samples
pub struct RollingAggregator {
    params: AggregationParams,
    window: FeatureWindow,
    last_tick_ms: u64,
}

impl RollingAggregator {
    /// `started_at_ms` anchors the first interval
    pub fn new(params: AggregationParams, started_at_ms: u64) -> Self {
        Self { params, window: FeatureWindow::new(params.capacity()), last_tick_ms: started_at_ms }
    }

    pub fn push(&mut self, sample: &EnvironmentSample) {
        self.window.push(sample);
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.window.capacity()
    }

    pub fn window(&self) -> &FeatureWindow {
        &self.window
    }

    /// Produce features if the interval elapsed and enough samples are buffered
    ///
    /// An unsuccessful tick leaves the interval anchor untouched.
    pub fn tick(&mut self, now_ms: u64) -> Option<AggregatedFeatures> {
        let elapsed_ms = now_ms.saturating_sub(self.last_tick_ms);
        if elapsed_ms < self.params.interval_secs * 1000 {
            return None;
        }
        if self.window.len() < self.params.min_samples {
            trace!(
                buffered = self.window.len(),
                required = self.params.min_samples,
                "aggregation_insufficient_samples"
            );
            return None;
        }

        let features = self.window.reduce(now_ms)?;
        self.last_tick_ms = now_ms;
        Some(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn env(motion: bool, sound: f64, co2: f64, at_ms: u64) -> EnvironmentSample {
        EnvironmentSample {
            motion_active: motion,
            sound_level_db: sound,
            co2_ppm: co2,
            timestamp_ms: T0 + at_ms,
        }
    }

    #[test]
    fn test_ring_buffer_evicts_oldest_first() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        assert_eq!(ring.push(2), None);
        assert_eq!(ring.push(3), None);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.push(5), Some(2));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_ring_buffer_clear() {
        let mut ring = RingBuffer::new(2);
        ring.push(1);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.capacity(), 2);
    }

    #[test]
    fn test_capacity_from_window_and_rate() {
        assert_eq!(AggregationParams::default().capacity(), 300);
        let params = AggregationParams { window_secs: 60, sample_rate_hz: 2.0, ..Default::default() };
        assert_eq!(params.capacity(), 120);
        let params = AggregationParams { window_secs: 1, sample_rate_hz: 0.1, ..Default::default() };
        assert_eq!(params.capacity(), 1);
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let params = AggregationParams { window_secs: 5, ..Default::default() };
        let mut aggregator = RollingAggregator::new(params, T0);

        for i in 0..50 {
            aggregator.push(&env(i % 2 == 0, 40.0, 500.0, i * 1000));
            assert!(aggregator.len() <= 5);
        }
        assert_eq!(aggregator.len(), 5);
    }

    #[test]
    fn test_window_reflects_only_newest_samples() {
        let params = AggregationParams {
            window_secs: 3,
            interval_secs: 1,
            min_samples: 1,
            ..Default::default()
        };
        let mut aggregator = RollingAggregator::new(params, T0);

        aggregator.push(&env(false, 100.0, 100.0, 0));
        aggregator.push(&env(true, 30.0, 400.0, 1000));
        aggregator.push(&env(true, 40.0, 500.0, 2000));
        aggregator.push(&env(true, 50.0, 600.0, 3000));

        let features = aggregator.tick(T0 + 3000).unwrap();
        assert_eq!(features.motion_rate, 1.0);
        assert!((features.avg_sound - 40.0).abs() < 1e-9);
        assert!((features.avg_co2 - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_before_min_samples_returns_none() {
        let mut aggregator = RollingAggregator::new(AggregationParams::default(), T0);

        for i in 0..9 {
            aggregator.push(&env(true, 60.0, 1000.0, i * 1000));
        }

        assert!(aggregator.tick(T0 + 60_000).is_none());
    }

    #[test]
    fn test_tick_before_interval_returns_none() {
        let mut aggregator = RollingAggregator::new(AggregationParams::default(), T0);

        for i in 0..20 {
            aggregator.push(&env(true, 60.0, 1000.0, i * 100));
        }

        assert!(aggregator.tick(T0 + 9_999).is_none());
        assert!(aggregator.tick(T0 + 10_000).is_some());
    }

    #[test]
    fn test_twelve_samples_reduce_to_expected_features() {
        let mut aggregator = RollingAggregator::new(AggregationParams::default(), T0);

        for i in 0..12 {
            aggregator.push(&env(true, 60.0, 1000.0, i * 1000));
        }

        let features = aggregator.tick(T0 + 12_000).unwrap();
        assert_eq!(features.motion_rate, 1.0);
        assert_eq!(features.avg_sound, 60.0);
        assert_eq!(features.avg_co2, 1000.0);
        assert_eq!(features.timestamp_ms, T0 + 12_000);
    }

    #[test]
    fn test_motion_rate_is_fraction_active() {
        let params = AggregationParams { min_samples: 4, ..Default::default() };
        let mut aggregator = RollingAggregator::new(params, T0);

        aggregator.push(&env(true, 50.0, 500.0, 0));
        aggregator.push(&env(false, 50.0, 500.0, 1000));
        aggregator.push(&env(false, 50.0, 500.0, 2000));
        aggregator.push(&env(true, 50.0, 500.0, 3000));

        let features = aggregator.tick(T0 + 10_000).unwrap();
        assert_eq!(features.motion_rate, 0.5);
    }

    #[test]
    fn test_successful_tick_resets_interval() {
        let mut aggregator = RollingAggregator::new(AggregationParams::default(), T0);
        for i in 0..10 {
            aggregator.push(&env(true, 60.0, 1000.0, i * 1000));
        }

        assert!(aggregator.tick(T0 + 10_000).is_some());
        assert!(aggregator.tick(T0 + 15_000).is_none());
        assert!(aggregator.tick(T0 + 20_000).is_some());
    }

    #[test]
    fn test_failed_tick_keeps_anchor() {
        let mut aggregator = RollingAggregator::new(AggregationParams::default(), T0);

        // Interval elapsed but too few samples
        assert!(aggregator.tick(T0 + 10_000).is_none());

        for i in 0..10 {
            aggregator.push(&env(false, 35.0, 420.0, 10_000 + i * 100));
        }

        // Anchor was not moved, so the next check succeeds immediately
        assert!(aggregator.tick(T0 + 11_000).is_some());
    }
}
