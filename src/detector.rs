//! Change detection over successive byte reads.
//!
//! The first observation only establishes a baseline. After that, any frame that
//! differs from the previous one in at least one bit yields a [`StepChange`].
//!
//! # Known limitation
//!
//! Equality is exact: there is no debouncing or hysteresis. A bit that flickers for a
//! single poll cycle produces two events (away and back), so the poll interval is the
//! effective time resolution of the pulse train and also its noise floor.

use std::time::{Duration, Instant};

use crate::decoder::{decode, BitVector, BitWidth};

/// One detected transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
    /// Frame observed after the transition.
    pub vector: BitVector,
    /// `vector` read as an unsigned number.
    pub step_value: u32,
    /// Time spent in the previous state.
    pub time_to_change: Duration,
    /// Monotonic instant of the observation that triggered the event.
    pub observed_at: Instant,
}

/// Stateful detector holding the last observed frame.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    width: BitWidth,
    last_vector: Option<BitVector>,
    last_change: Option<Instant>,
}

impl ChangeDetector {
    /// Create a detector for frames of `width` bits.
    pub fn new(width: BitWidth) -> Self {
        Self {
            width,
            last_vector: None,
            last_change: None,
        }
    }

    /// Observe a byte read now.
    pub fn observe(&mut self, byte: u8) -> Option<StepChange> {
        self.observe_at(byte, Instant::now())
    }

    /// Observe a byte read at `now`.
    pub fn observe_at(&mut self, byte: u8, now: Instant) -> Option<StepChange> {
        let vector = decode(byte, self.width);

        let (Some(last), Some(since)) = (self.last_vector.as_ref(), self.last_change) else {
            self.last_vector = Some(vector);
            self.last_change = Some(now);
            return None;
        };

        if *last == vector {
            return None;
        }

        let time_to_change = now.saturating_duration_since(since);
        let step_value = vector.step_value();
        self.last_vector = Some(vector.clone());
        self.last_change = Some(now);

        Some(StepChange {
            vector,
            step_value,
            time_to_change,
            observed_at: now,
        })
    }

    /// Close the current state at `now` without a transition.
    ///
    /// Returns the last frame together with how long it has been held, or `None`
    /// before the baseline exists.
    pub fn dwell(&self, now: Instant) -> Option<StepChange> {
        let vector = self.last_vector.clone()?;
        let since = self.last_change?;
        Some(StepChange {
            step_value: vector.step_value(),
            vector,
            time_to_change: now.saturating_duration_since(since),
            observed_at: now,
        })
    }

    /// Last frame seen, if any.
    pub fn last_vector(&self) -> Option<&BitVector> {
        self.last_vector.as_ref()
    }

    /// Frame width this detector decodes.
    pub fn width(&self) -> BitWidth {
        self.width
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ChangeDetector {
        ChangeDetector::new(BitWidth::new(8).unwrap())
    }

    #[test]
    fn baseline_is_not_a_change() {
        let mut det = detector();
        assert!(det.observe(0b0000_0101).is_none());
        assert_eq!(det.last_vector().map(BitVector::step_value), Some(5));
    }

    #[test]
    fn reference_sequence_emits_on_polls_two_and_four() {
        let mut det = detector();
        let events: Vec<Option<u32>> = [0b0000_0000u8, 0b0000_0001, 0b0000_0001, 0b0000_0011]
            .into_iter()
            .map(|byte| det.observe(byte).map(|e| e.step_value))
            .collect();
        assert_eq!(events, vec![None, Some(1), None, Some(3)]);
    }

    #[test]
    fn time_to_change_measures_previous_state() {
        let mut det = detector();
        let t0 = Instant::now();
        det.observe_at(0, t0);
        assert!(det.observe_at(0, t0 + Duration::from_millis(40)).is_none());
        let event = det.observe_at(1, t0 + Duration::from_millis(100)).unwrap();
        assert_eq!(event.time_to_change, Duration::from_millis(100));

        let event = det.observe_at(3, t0 + Duration::from_millis(130)).unwrap();
        assert_eq!(event.time_to_change, Duration::from_millis(30));
    }

    #[test]
    fn bits_outside_width_are_ignored() {
        let mut det = ChangeDetector::new(BitWidth::new(2).unwrap());
        det.observe(0b0000_0001);
        assert!(det.observe(0b1111_0001).is_none());
        assert!(det.observe(0b0000_0011).is_some());
    }

    #[test]
    fn dwell_reports_last_state() {
        let mut det = detector();
        let t0 = Instant::now();
        assert!(det.dwell(t0).is_none());
        det.observe_at(6, t0);
        let closing = det.dwell(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(closing.step_value, 6);
        assert_eq!(closing.time_to_change, Duration::from_secs(2));
    }
}
