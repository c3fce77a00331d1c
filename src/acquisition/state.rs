//! Acquisition loop lifecycle.

use serde::{Deserialize, Serialize};

/// State of one acquisition loop.
///
/// # State Machine
///
/// ```text
///                 ┌──change / no change──┐
///                 ▼                      │
/// Idle ──start──> Polling ───────────────┘
///  ▲                 │
///  │    timeout, stop signal or
///  │    too many failed reads
///  │                 ▼
///  │             Exporting ──always──> Stopped
///  │                                      │
///  └──────────────new run─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// Waiting for a run to start
    Idle,
    /// Reading bytes on the poll cadence
    Polling,
    /// Writing the final export and run summary
    Exporting,
    /// Run finished
    Stopped,
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionState::Idle => write!(f, "Idle"),
            AcquisitionState::Polling => write!(f, "Polling"),
            AcquisitionState::Exporting => write!(f, "Exporting"),
            AcquisitionState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl AcquisitionState {
    /// Check if a new run may start from this state.
    pub fn can_begin(&self) -> bool {
        matches!(self, AcquisitionState::Idle | AcquisitionState::Stopped)
    }

    /// Check if `next` is a legal successor.
    pub fn can_transition_to(&self, next: AcquisitionState) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, next),
            (Idle, Polling)
                | (Polling, Polling)
                | (Polling, Exporting)
                | (Exporting, Stopped)
                | (Stopped, Idle)
        )
    }

    /// Check if this is the terminal state of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionState::Stopped)
    }
}
