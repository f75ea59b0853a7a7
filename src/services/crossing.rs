//! Doorway crossing detection from a paired A/B beam sensor
//!
//! A person walking in breaks beam A, then beam B; walking out breaks B,
//! then A. The detector correlates the second rising edge with the other
//! beam's most recent activity inside an adaptive debounce window.
//!
//! Key behaviors:
//! - EXIT is checked before ENTER, so a sample satisfying both yields EXIT
//! - At most one event per sample, and none within `min_event_gap_secs`
//!   of the previous event
//! - The count never drops below zero
//! - The debounce window is recomputed after every sample from how recently
//!   each beam was active, then clamped to [min, max]

use crate::domain::types::{CrossingEvent, CrossingKind, SensorSample};
use tracing::{debug, trace};

/// Tuning for the crossing state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossingParams {
    /// Lower bound of the debounce window (seconds)
    pub min_debounce_secs: f64,
    /// Upper bound of the debounce window (seconds)
    pub max_debounce_secs: f64,
    /// Multiplier applied to the mean beam recency
    pub debounce_scale: f64,
    /// Refractory period after any emitted event (seconds)
    pub min_event_gap_secs: f64,
}

impl Default for CrossingParams {
    fn default() -> Self {
        Self {
            min_debounce_secs: 0.4,
            max_debounce_secs: 1.5,
            debounce_scale: 0.8,
            min_event_gap_secs: 1.0,
        }
    }
}

/// Seconds elapsed since `since`, or infinity for a beam never seen active
#[inline]
fn age_secs(now_ms: u64, since: Option<u64>) -> f64 {
    match since {
        Some(t) => now_ms.saturating_sub(t) as f64 / 1000.0,
        None => f64::INFINITY,
    }
}

/// Debounce window derived from how recently each beam was active
///
/// `scale * mean(age_a, age_b)` clamped to the configured bounds. A beam
/// that has never been active counts as infinitely old, which relaxes the
/// window to its ceiling.
pub fn adaptive_debounce(
    last_a_active_at: Option<u64>,
    last_b_active_at: Option<u64>,
    now_ms: u64,
    params: &CrossingParams,
) -> f64 {
    let mean_age = (age_secs(now_ms, last_a_active_at) + age_secs(now_ms, last_b_active_at)) / 2.0;
    let window = mean_age * params.debounce_scale;
    if !window.is_finite() {
        return params.max_debounce_secs;
    }
    window.clamp(params.min_debounce_secs, params.max_debounce_secs)
}

/// Per-doorway crossing state
#[derive(Debug, Clone, PartialEq)]
pub struct CrossingState {
    pub sensor_a_active: bool,
    pub sensor_b_active: bool,
    /// Last time beam A read active (epoch ms), None until first activation
    pub last_a_active_at: Option<u64>,
    pub last_b_active_at: Option<u64>,
    pub last_event_at: Option<u64>,
    pub current_debounce_secs: f64,
    pub occupancy_count: u32,
}

impl CrossingState {
    pub fn new(params: &CrossingParams) -> Self {
        Self {
            sensor_a_active: false,
            sensor_b_active: false,
            last_a_active_at: None,
            last_b_active_at: None,
            last_event_at: None,
            current_debounce_secs: params.max_debounce_secs,
            occupancy_count: 0,
        }
    }
}

/// Crossing state machine for a single doorway
pub struct CrossingDetector {
    params: CrossingParams,
    state: CrossingState,
}

impl CrossingDetector {
    pub fn new(params: CrossingParams) -> Self {
        let state = CrossingState::new(&params);
        Self { params, state }
    }

    pub fn state(&self) -> &CrossingState {
        &self.state
    }

    pub fn occupancy(&self) -> u32 {
        self.state.occupancy_count
    }

    pub fn debounce_secs(&self) -> f64 {
        self.state.current_debounce_secs
    }

    /// Feed one sample; returns the crossing it completes, if any
    pub fn update(&mut self, sample: &SensorSample) -> Option<CrossingEvent> {
        let now = sample.timestamp_ms;
        let a_rising = sample.sensor_a_active && !self.state.sensor_a_active;
        let b_rising = sample.sensor_b_active && !self.state.sensor_b_active;

        self.state.sensor_a_active = sample.sensor_a_active;
        self.state.sensor_b_active = sample.sensor_b_active;
        if sample.sensor_a_active {
            self.state.last_a_active_at = Some(now);
        }
        if sample.sensor_b_active {
            self.state.last_b_active_at = Some(now);
        }

        let window = self.state.current_debounce_secs;
        let exit_candidate = a_rising && age_secs(now, self.state.last_b_active_at) < window;
        let enter_candidate = b_rising && age_secs(now, self.state.last_a_active_at) < window;

        let event = if exit_candidate || enter_candidate {
            let since_last = age_secs(now, self.state.last_event_at);
            if since_last < self.params.min_event_gap_secs {
                debug!(
                    since_last_secs = format!("{:.3}", since_last),
                    exit = exit_candidate,
                    "crossing_suppressed_refractory"
                );
                None
            } else if exit_candidate {
                self.state.occupancy_count = self.state.occupancy_count.saturating_sub(1);
                Some(CrossingKind::Exit)
            } else {
                self.state.occupancy_count = self.state.occupancy_count.saturating_add(1);
                Some(CrossingKind::Enter)
            }
        } else {
            None
        };

        if event.is_some() {
            self.state.last_event_at = Some(now);
        }

        self.state.current_debounce_secs = adaptive_debounce(
            self.state.last_a_active_at,
            self.state.last_b_active_at,
            now,
            &self.params,
        );

        trace!(
            a = sample.sensor_a_active,
            b = sample.sensor_b_active,
            debounce_secs = format!("{:.3}", self.state.current_debounce_secs),
            "crossing_sample"
        );

        event.map(|kind| CrossingEvent {
            kind,
            timestamp_ms: now,
            resulting_count: self.state.occupancy_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const T0: u64 = 1_700_000_000_000;

    fn sample(a: u8, b: u8, at_ms: u64) -> SensorSample {
        SensorSample { sensor_a_active: a == 1, sensor_b_active: b == 1, timestamp_ms: T0 + at_ms }
    }

    fn feed(detector: &mut CrossingDetector, samples: &[SensorSample]) -> Vec<CrossingEvent> {
        samples.iter().filter_map(|s| detector.update(s)).collect()
    }

    #[test]
    fn test_a_then_b_is_enter() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        let events = feed(&mut detector, &[sample(1, 0, 0), sample(0, 1, 300)]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Enter);
        assert_eq!(events[0].resulting_count, 1);
        assert_eq!(events[0].timestamp_ms, T0 + 300);
        assert_eq!(detector.occupancy(), 1);
    }

    #[test]
    fn test_b_then_a_is_exit_clamped_at_zero() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        let events = feed(&mut detector, &[sample(0, 1, 0), sample(1, 0, 300)]);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CrossingKind::Exit);
        assert_eq!(events[0].resulting_count, 0);
        assert_eq!(detector.occupancy(), 0);
    }

    #[test]
    fn test_enter_then_exit_restores_count() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        let events = feed(
            &mut detector,
            &[
                sample(1, 0, 0),
                sample(0, 1, 300),
                sample(0, 0, 2_000),
                sample(0, 1, 3_000),
                sample(1, 0, 3_300),
                sample(0, 0, 4_000),
            ],
        );

        let kinds: Vec<CrossingKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![CrossingKind::Enter, CrossingKind::Exit]);
        assert_eq!(detector.occupancy(), 0);
    }

    #[test]
    fn test_first_sample_never_fires() {
        let mut detector = CrossingDetector::new(CrossingParams::default());
        assert!(detector.update(&sample(1, 0, 0)).is_none());

        let mut detector = CrossingDetector::new(CrossingParams::default());
        assert!(detector.update(&sample(0, 1, 0)).is_none());
    }

    #[test]
    fn test_simultaneous_rise_favors_exit() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        // One person inside so the EXIT is observable as a decrement
        feed(&mut detector, &[sample(1, 0, 0), sample(0, 1, 300), sample(0, 0, 2_000)]);
        assert_eq!(detector.occupancy(), 1);

        let event = detector.update(&sample(1, 1, 3_000)).unwrap();
        assert_eq!(event.kind, CrossingKind::Exit);
        assert_eq!(detector.occupancy(), 0);
    }

    #[test]
    fn test_refractory_gap_suppresses_second_event() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        let events = feed(
            &mut detector,
            &[
                sample(1, 0, 0),
                sample(0, 1, 200),
                sample(0, 0, 300),
                // Second A->B within 1s of the previous event
                sample(1, 0, 500),
                sample(0, 1, 700),
            ],
        );

        assert_eq!(events.len(), 1);
        assert_eq!(detector.occupancy(), 1);
    }

    #[test]
    fn test_slow_gap_outside_window_does_not_fire() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        let events = feed(&mut detector, &[sample(1, 0, 0), sample(0, 0, 100), sample(0, 1, 2_000)]);

        assert!(events.is_empty());
        assert_eq!(detector.occupancy(), 0);
    }

    #[test]
    fn test_held_beam_does_not_retrigger() {
        let mut detector = CrossingDetector::new(CrossingParams::default());

        // B stays active across samples: only its first rising edge counts
        let events = feed(
            &mut detector,
            &[sample(1, 0, 0), sample(0, 1, 300), sample(0, 1, 1_500), sample(0, 1, 2_700)],
        );

        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_adaptive_debounce_ceiling_when_never_active() {
        let params = CrossingParams::default();
        assert_eq!(adaptive_debounce(None, None, T0, &params), 1.5);
        assert_eq!(adaptive_debounce(Some(T0), None, T0, &params), 1.5);
    }

    #[test]
    fn test_adaptive_debounce_floor_when_both_fresh() {
        let params = CrossingParams::default();
        assert_eq!(adaptive_debounce(Some(T0), Some(T0), T0, &params), 0.4);
    }

    #[test]
    fn test_adaptive_debounce_scales_mean_age() {
        let params = CrossingParams::default();
        // mean(1.0, 0.5) * 0.8 = 0.6
        let window = adaptive_debounce(Some(T0 - 1_000), Some(T0 - 500), T0, &params);
        assert!((window - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_adaptive_debounce_respects_custom_params() {
        let params = CrossingParams {
            min_debounce_secs: 0.2,
            max_debounce_secs: 3.0,
            debounce_scale: 1.0,
            min_event_gap_secs: 0.5,
        };
        let window = adaptive_debounce(Some(T0 - 2_000), Some(T0 - 2_000), T0, &params);
        assert!((window - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_random_sequences_keep_invariants() {
        let params = CrossingParams::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let mut detector = CrossingDetector::new(params);
            let mut at = 0u64;
            let mut expected: i64 = 0;

            for _ in 0..500 {
                at += rng.gen_range(10..2_500);
                let s = sample(rng.gen_range(0..2), rng.gen_range(0..2), at);
                if let Some(event) = detector.update(&s) {
                    expected = match event.kind {
                        CrossingKind::Enter => expected + 1,
                        CrossingKind::Exit => (expected - 1).max(0),
                    };
                    assert_eq!(event.resulting_count as i64, expected);
                }

                let window = detector.debounce_secs();
                assert!((params.min_debounce_secs..=params.max_debounce_secs).contains(&window));
            }
        }
    }

    #[test]
    fn test_initial_state() {
        let detector = CrossingDetector::new(CrossingParams::default());
        let state = detector.state();
        assert_eq!(state.occupancy_count, 0);
        assert!(state.last_a_active_at.is_none());
        assert!(state.last_b_active_at.is_none());
        assert!(state.last_event_at.is_none());
        assert_eq!(state.current_debounce_secs, 1.5);
    }
}
