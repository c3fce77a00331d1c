//! Run report produced when a loop reaches `Stopped`.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::ground_truth::PatternComparison;
use crate::pulse_train::format_pattern;

/// Why polling ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Run timeout elapsed.
    Timeout,
    /// External stop signal.
    StopSignal,
    /// Consecutive read failures reached the configured threshold.
    TransportFailures,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Timeout => write!(f, "timeout"),
            StopReason::StopSignal => write!(f, "stop signal"),
            StopReason::TransportFailures => write!(f, "transport failures"),
        }
    }
}

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Ran to its terminal condition with every record stored and exported.
    Success,
    /// Ended early on transport failures, or some records only reached the fallback buffer.
    Degraded,
    /// The final export could not be written.
    Failed,
}

impl RunOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Degraded => 2,
            RunOutcome::Failed => 3,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Success => write!(f, "success"),
            RunOutcome::Degraded => write!(f, "degraded"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Counters and artifacts of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Experiment name the run was started for.
    pub experiment: String,
    /// Identifier reserved for this run.
    pub experiment_id: i64,
    pub outcome: RunOutcome,
    /// Why polling ended.
    pub stop_reason: StopReason,
    /// Steps appended to the pulse train (closing record included).
    pub steps: usize,
    /// Byte reads attempted.
    pub reads: u64,
    /// Byte reads that failed or timed out.
    pub read_failures: u64,
    /// Step rows acknowledged by storage.
    pub stored: usize,
    /// Step rows parked in the fallback buffer.
    pub buffered: usize,
    /// Step rows neither stored nor buffered.
    pub lost: usize,
    /// Incremental snapshots written.
    pub exports_written: usize,
    /// Incremental snapshots that failed.
    pub export_failures: usize,
    /// Files written by the final export, one per format.
    pub final_exports: Vec<PathBuf>,
    /// Error of the final export after its retry budget.
    pub final_export_error: Option<String>,
    /// Summary row acknowledged by storage.
    pub summary_stored: bool,
    /// Summary row parked in the fallback buffer.
    pub summary_buffered: bool,
    /// Step values in step order.
    pub pattern: Vec<u32>,
    /// Comparison against the experiment's ground truth, when one exists.
    pub comparison: Option<PatternComparison>,
    /// Wall time from start to the end of finalization.
    pub elapsed: Duration,
}

impl RunReport {
    /// Outcome implied by the counters.
    pub(crate) fn classify(&self) -> RunOutcome {
        if self.final_export_error.is_some() {
            RunOutcome::Failed
        } else if self.stop_reason == StopReason::TransportFailures
            || self.buffered > 0
            || self.lost > 0
            || !self.summary_stored
        {
            RunOutcome::Degraded
        } else {
            RunOutcome::Success
        }
    }

    /// Process exit status.
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run {} #{}: {} ({}, {:.1}s)",
            self.experiment,
            self.experiment_id,
            self.outcome,
            self.stop_reason,
            self.elapsed.as_secs_f64()
        )?;
        writeln!(f, "  pattern:   {}", format_pattern(&self.pattern))?;
        writeln!(
            f,
            "  steps:     {} (stored {}, buffered {}, lost {})",
            self.steps, self.stored, self.buffered, self.lost
        )?;
        writeln!(f, "  reads:     {} ({} failed)", self.reads, self.read_failures)?;
        writeln!(
            f,
            "  summary:   {}",
            match (self.summary_stored, self.summary_buffered) {
                (true, _) => "stored",
                (false, true) => "buffered",
                (false, false) => "not stored",
            }
        )?;
        writeln!(
            f,
            "  snapshots: {} written, {} failed",
            self.exports_written, self.export_failures
        )?;
        for path in &self.final_exports {
            writeln!(f, "  export:    {}", path.display())?;
        }
        if let Some(err) = &self.final_export_error {
            writeln!(f, "  export:    FAILED: {err}")?;
        }
        if let Some(comparison) = &self.comparison {
            writeln!(f, "  reference: {comparison}")?;
        }
        Ok(())
    }
}
