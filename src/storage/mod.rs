//! Storage gateway: backend-agnostic persistence for the acquisition engine.
//!
//! The engine talks to storage only through [`StorageGateway`]. Two adapters implement
//! it against different engines:
//!
//! - [`SqliteGateway`]: a single SQLite database file (`rusqlite`).
//! - [`CsvDirectoryGateway`]: a directory of CSV tables plus TOML configuration files.
//!
//! Which one is active is decided once at startup by [`factory::open_gateway`] from the
//! `storage.backend` setting, and the chosen gateway is injected into the acquisition
//! loop as `Arc<dyn StorageGateway>`. Both adapters serialise writes internally, so one
//! gateway can be shared by several concurrent acquisition streams.
//!
//! Records whose insert keeps failing are parked in the [`FallbackBuffer`].

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoder::{BitWidth, DecodeError};
use crate::pulse_train::{PulseTrainSummary, StepRecord};
use crate::retry::TimeoutError;
use crate::transport::PlcAddress;

pub mod csv_dir;
pub mod factory;
pub mod fallback;
pub mod sqlite;

pub use csv_dir::CsvDirectoryGateway;
pub use factory::{open_gateway, GatewayRegistry};
pub use fallback::{FallbackBuffer, FallbackEntry, ReplayStats};
pub use sqlite::SqliteGateway;

/// Storage failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// No experiment configuration with this name.
    #[error("experiment '{0}' not found")]
    NotFound(String),

    /// The call did not complete in time.
    #[error("storage call timed out after {0} ms")]
    Timeout(u64),

    /// Backend cannot be reached (connection refused, file missing, lock poisoned).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Backend rejected the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Stored data could not be (de)serialised.
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl TimeoutError for StorageError {
    fn timed_out(after: Duration) -> Self {
        StorageError::Timeout(after.as_millis() as u64)
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        StorageError::Backend(value.to_string())
    }
}

impl From<csv::Error> for StorageError {
    fn from(value: csv::Error) -> Self {
        StorageError::Backend(value.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(value: std::io::Error) -> Self {
        StorageError::Unavailable(value.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(value: serde_json::Error) -> Self {
        StorageError::Serialization(value.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(value: tokio::task::JoinError) -> Self {
        StorageError::Unavailable(format!("storage worker failed: {value}"))
    }
}

/// One experiment's transport address and IO layout (a `plant_config` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Unique experiment name.
    pub name: String,
    /// PLC host or IP.
    pub host: String,
    /// Rack number.
    pub rack: u16,
    /// Slot number.
    pub slot: u16,
    /// Data block holding the monitored byte.
    pub db_number: u16,
    /// Declared input bits.
    pub num_inputs: u8,
    /// Declared output bits.
    pub num_outputs: u8,
}

impl ExperimentConfig {
    /// Frame width: inputs plus outputs, validated to `1..=8`.
    pub fn bit_width(&self) -> Result<BitWidth, DecodeError> {
        BitWidth::try_from(usize::from(self.num_inputs) + usize::from(self.num_outputs))
    }

    /// Transport address of the monitored byte.
    pub fn address(&self) -> PlcAddress {
        PlcAddress {
            host: self.host.clone(),
            rack: self.rack,
            slot: self.slot,
            db_number: self.db_number,
        }
    }
}

/// Reference pattern authored out of band (a `ground_truth_patterns` row).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthPattern {
    /// Experiment the pattern belongs to.
    pub experiment_name: String,
    /// Pattern text, bracketed and comma separated.
    pub ground_truth: String,
}

/// Persistence capability used by the acquisition engine.
///
/// Implementations must be safe to call from several tasks at once: distinct records
/// written concurrently are never lost or interleaved.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Configuration of `experiment_name`, or [`StorageError::NotFound`].
    async fn get_config(&self, experiment_name: &str) -> Result<ExperimentConfig, StorageError>;

    /// Names of all configured experiments, sorted.
    async fn list_experiments(&self) -> Result<Vec<String>, StorageError>;

    /// Create or replace an experiment configuration.
    async fn upsert_config(&self, config: &ExperimentConfig) -> Result<(), StorageError>;

    /// Identifier for a new run: one above the highest stored id, or 1.
    async fn next_experiment_id(&self) -> Result<i64, StorageError>;

    /// Append one step row.
    async fn insert_step(&self, record: &StepRecord) -> Result<(), StorageError>;

    /// Append one run summary row.
    async fn insert_summary(&self, summary: &PulseTrainSummary) -> Result<(), StorageError>;

    /// Step values of a run, ordered by step index.
    async fn get_pulse_values(&self, experiment_id: i64) -> Result<Vec<u32>, StorageError>;

    /// Latest summary stored for a run.
    async fn get_summary(&self, experiment_id: i64) -> Result<Option<PulseTrainSummary>, StorageError>;

    /// Reference pattern for an experiment, if one was authored.
    async fn get_ground_truth(
        &self,
        experiment_name: &str,
    ) -> Result<Option<GroundTruthPattern>, StorageError>;

    /// Create or replace a reference pattern.
    async fn upsert_ground_truth(&self, pattern: &GroundTruthPattern) -> Result<(), StorageError>;
}
