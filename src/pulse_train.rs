//! Pulse-train accumulation for one acquisition run.
//!
//! The accumulator turns [`StepChange`] events into append-only [`StepRecord`]s with
//! contiguous step indices, and produces the run's [`PulseTrainSummary`] once the run
//! has ended.

use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::detector::StepChange;

/// First step index of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepOrigin {
    /// Steps are numbered from 0.
    #[default]
    Zero,
    /// Steps are numbered from 1.
    One,
}

impl StepOrigin {
    /// Index assigned to the first step.
    pub fn first_index(self) -> u64 {
        match self {
            StepOrigin::Zero => 0,
            StepOrigin::One => 1,
        }
    }
}

impl TryFrom<u8> for StepOrigin {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StepOrigin::Zero),
            1 => Ok(StepOrigin::One),
            other => Err(format!("step origin must be 0 or 1, got {other}")),
        }
    }
}

/// One persisted transition (a `dadoscoletados2` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Experiment configuration name.
    pub experiment_name: String,
    /// Run identifier.
    pub experiment_id: i64,
    /// Contiguous index within the run.
    pub step: u64,
    /// Bit pattern text, LSB first.
    pub pattern: String,
    /// Decoded step value.
    pub step_value: u32,
    /// Seconds spent in the previous state.
    pub time_to_change_s: f64,
    /// Wall-clock time of the observation, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Seconds since the run started.
    pub float_value: f64,
    /// Set on the trailing record that closes the last state at run end.
    #[serde(default)]
    pub closing: bool,
}

/// Concatenated pattern of a finished run (a `dadoscoletados_summary` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseTrainSummary {
    /// Run identifier.
    pub experiment_id: i64,
    /// Step values in step order, in bracketed form (`[1,3,2]`).
    pub pattern: String,
    /// Completion time, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

/// Render step values in the bracketed summary form.
pub fn format_pattern(values: &[u32]) -> String {
    let joined: Vec<String> = values.iter().map(u32::to_string).collect();
    format!("[{}]", joined.join(","))
}

/// Append-only step sequence of the active run.
#[derive(Debug)]
pub struct PulseTrainAccumulator {
    experiment_name: String,
    experiment_id: i64,
    origin: StepOrigin,
    started_at: Instant,
    records: Vec<StepRecord>,
}

impl PulseTrainAccumulator {
    /// Start accumulating for a run.
    pub fn new(experiment_name: impl Into<String>, experiment_id: i64, origin: StepOrigin) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            experiment_id,
            origin,
            started_at: Instant::now(),
            records: Vec::new(),
        }
    }

    /// Clear all state and begin a new run context.
    pub fn reset(&mut self, experiment_id: i64) {
        self.experiment_id = experiment_id;
        self.started_at = Instant::now();
        self.records.clear();
    }

    /// Record a transition under the next step index.
    pub fn append(&mut self, event: &StepChange) -> StepRecord {
        self.push(event, false)
    }

    /// Record the dwell of the final state when the run ends.
    pub fn append_closing(&mut self, event: &StepChange) -> StepRecord {
        self.push(event, true)
    }

    fn push(&mut self, event: &StepChange, closing: bool) -> StepRecord {
        let record = StepRecord {
            experiment_name: self.experiment_name.clone(),
            experiment_id: self.experiment_id,
            step: self.next_index(),
            pattern: event.vector.pattern(),
            step_value: event.step_value,
            time_to_change_s: event.time_to_change.as_secs_f64(),
            timestamp_ms: Utc::now().timestamp_millis(),
            float_value: event
                .observed_at
                .saturating_duration_since(self.started_at)
                .as_secs_f64(),
            closing,
        };
        self.records.push(record.clone());
        record
    }

    fn next_index(&self) -> u64 {
        self.origin.first_index() + self.records.len() as u64
    }

    /// Step values accumulated so far, in step order.
    pub fn snapshot_pattern(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.step_value).collect()
    }

    /// Records accumulated so far.
    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    /// Number of steps recorded.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no step has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Run identifier.
    pub fn experiment_id(&self) -> i64 {
        self.experiment_id
    }

    /// When the current run context began.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Summary of everything accumulated, stamped now.
    pub fn summary(&self) -> PulseTrainSummary {
        PulseTrainSummary {
            experiment_id: self.experiment_id,
            pattern: format_pattern(&self.snapshot_pattern()),
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, BitWidth};
    use std::time::Duration;

    fn change(byte: u8) -> StepChange {
        let vector = decode(byte, BitWidth::new(4).unwrap());
        StepChange {
            step_value: vector.step_value(),
            vector,
            time_to_change: Duration::from_millis(250),
            observed_at: Instant::now(),
        }
    }

    #[test]
    fn indices_are_contiguous_from_origin() {
        for (origin, first) in [(StepOrigin::Zero, 0), (StepOrigin::One, 1)] {
            let mut acc = PulseTrainAccumulator::new("mixer", 7, origin);
            let steps: Vec<u64> = [1u8, 3, 2].iter().map(|b| acc.append(&change(*b)).step).collect();
            assert_eq!(steps, vec![first, first + 1, first + 2]);
        }
    }

    #[test]
    fn record_carries_event_fields() {
        let mut acc = PulseTrainAccumulator::new("mixer", 7, StepOrigin::Zero);
        let record = acc.append(&change(0b0101));
        assert_eq!(record.experiment_name, "mixer");
        assert_eq!(record.experiment_id, 7);
        assert_eq!(record.pattern, "[true,false,true,false]");
        assert_eq!(record.step_value, 5);
        assert!((record.time_to_change_s - 0.25).abs() < 1e-9);
        assert!(!record.closing);
    }

    #[test]
    fn summary_concatenates_in_step_order() {
        let mut acc = PulseTrainAccumulator::new("mixer", 3, StepOrigin::Zero);
        for byte in [1u8, 3, 2, 0] {
            acc.append(&change(byte));
        }
        assert_eq!(acc.snapshot_pattern(), vec![1, 3, 2, 0]);
        let summary = acc.summary();
        assert_eq!(summary.experiment_id, 3);
        assert_eq!(summary.pattern, "[1,3,2,0]");
    }

    #[test]
    fn reset_starts_a_new_run() {
        let mut acc = PulseTrainAccumulator::new("mixer", 3, StepOrigin::One);
        acc.append(&change(1));
        acc.reset(4);
        assert!(acc.is_empty());
        assert_eq!(acc.experiment_id(), 4);
        assert_eq!(acc.append(&change(2)).step, 1);
    }

    #[test]
    fn empty_run_has_empty_pattern() {
        let acc = PulseTrainAccumulator::new("mixer", 1, StepOrigin::Zero);
        assert_eq!(acc.summary().pattern, "[]");
        assert_eq!(format_pattern(&[]), "[]");
    }

    #[test]
    fn origin_from_config_value() {
        assert_eq!(StepOrigin::try_from(1), Ok(StepOrigin::One));
        assert!(StepOrigin::try_from(2).is_err());
    }
}
