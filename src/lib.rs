//! # Pulse Train DAQ Core Library
//!
//! Acquisition engine for PLC-driven lab experiments. A single memory byte of the
//! controller is polled on a fixed cadence; every change of its bit pattern becomes a
//! numbered step of the experiment's "pulse train", which is stored through a
//! backend-agnostic gateway and exported as versioned `.txt` / `.csv` snapshots.
//!
//! ## Crate Structure
//!
//! - **`decoder`**: raw byte to LSB-first bit vector and integer step value.
//! - **`detector`**: change detection with time-to-change measurement.
//! - **`pulse_train`**: the per-run accumulator, `StepRecord` and `PulseTrainSummary`.
//! - **`export`**: versioned, never-overwriting file exports.
//! - **`storage`**: the `StorageGateway` trait, SQLite and CSV-directory adapters, the
//!   local fallback buffer and the backend registry.
//! - **`transport`**: the `ByteSource` capability plus scripted and simulated PLCs.
//! - **`acquisition`**: the `Idle -> Polling -> Exporting -> Stopped` loop and run reports.
//! - **`ground_truth`**: post-hoc comparison with reference patterns.
//! - **`retry`**: bounded retry with backoff shared by storage and export.
//! - **`config`**, **`logging`**, **`error`**: settings, tracing setup and error taxonomy.

pub mod acquisition;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod error;
pub mod export;
pub mod ground_truth;
pub mod logging;
pub mod pulse_train;
pub mod retry;
pub mod storage;
pub mod transport;
