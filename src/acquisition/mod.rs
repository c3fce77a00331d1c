//! Acquisition loop: polling, change detection and the per-run record pipeline.
//!
//! ```text
//! ByteSource ──byte──> ChangeDetector ──StepChange──> PulseTrainAccumulator
//!                                                          │ StepRecord
//!                                                          ▼
//!                                           record sink task (ordered)
//!                                           ├── StorageGateway::insert_step (retry, fallback)
//!                                           └── VersionedExporter (every N steps)
//! ```
//!
//! The polling path never waits on storage or the filesystem. At the end of a run the
//! loop hands the full pulse train to the sink, which writes the final export and the
//! summary row, and waits for it within a bounded time.

pub mod engine;
pub mod report;
pub mod sink;
pub mod state;

pub use engine::{stop_channel, wait_for_state, AcquisitionLoop};
pub use report::{RunOutcome, RunReport, StopReason};
pub use state::AcquisitionState;
