//! Configuration loading using Figment.
//!
//! Settings come from, in increasing priority:
//! 1. Built-in defaults (every field has one, so an empty file is valid)
//! 2. A TOML file (`config/pulse_daq.toml` unless another path is given)
//! 3. Environment variables prefixed with `PULSE_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use pulse_train_daq::config::Settings;
//!
//! // PULSE_DAQ_STORAGE__BACKEND=csv overrides the file
//! let settings = Settings::load(None)?;
//! settings.validate()?;
//! println!("Storage backend: {}", settings.storage.backend);
//! # Ok::<(), pulse_train_daq::error::DaqError>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::DaqError;
use crate::export::{ExportFormat, ExportLayout};
use crate::pulse_train::StepOrigin;
use crate::retry::RetryPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/pulse_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PULSE_DAQ_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Polling loop settings
    #[serde(default)]
    pub acquisition: AcquisitionSettings,
    /// Storage gateway settings
    #[serde(default)]
    pub storage: StorageSettings,
    /// File export settings
    #[serde(default)]
    pub export: ExportSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Polling loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Delay between byte reads
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Run length before the loop stops on its own
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Deadline for a single byte read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Consecutive failed reads that end the run early
    #[serde(default = "default_max_consecutive_read_failures")]
    pub max_consecutive_read_failures: u32,
    /// First step index (0 or 1)
    #[serde(default)]
    pub step_origin: u8,
    /// Byte offset of the monitored frame inside the data block
    #[serde(default)]
    pub byte_offset: u16,
    /// Steps that may queue for storage/export before new ones go to the fallback buffer
    #[serde(default = "default_sink_queue_capacity")]
    pub sink_queue_capacity: usize,
    /// Upper bound on the end-of-run export and summary insert
    #[serde(default = "default_finalize_timeout_secs")]
    pub finalize_timeout_secs: u64,
    /// Append a closing record with the dwell time of the last state
    #[serde(default)]
    pub record_final_dwell: bool,
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Backend name (`sqlite` or `csv`)
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file for the `sqlite` backend
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Table directory for the `csv` backend
    #[serde(default = "default_csv_dir")]
    pub csv_dir: PathBuf,
    /// JSON-lines file for records storage could not take
    #[serde(default = "default_fallback_path")]
    pub fallback_path: PathBuf,
    /// Deadline for a single gateway call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Retry budget for gateway calls
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Root directory for exported files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Formats written for every snapshot
    #[serde(default = "default_formats")]
    pub formats: Vec<ExportFormat>,
    /// Group files in a `YYYY-MM-DD` sub-directory
    #[serde(default = "default_true")]
    pub dated_subdir: bool,
    /// Export a snapshot every N steps (0 = only at run end)
    #[serde(default = "default_incremental_every")]
    pub incremental_every: u64,
    /// Prefix for exported file names
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Deadline for a single export attempt
    #[serde(default = "default_export_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Retry budget for exports
    #[serde(default)]
    pub retry: RetryPolicy,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_run_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_ms() -> u64 {
    500
}

fn default_max_consecutive_read_failures() -> u32 {
    5
}

fn default_sink_queue_capacity() -> usize {
    1024
}

fn default_finalize_timeout_secs() -> u64 {
    30
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("data/remote_lab.sqlite3")
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("data/tables")
}

fn default_fallback_path() -> PathBuf {
    PathBuf::from("data/fallback.jsonl")
}

fn default_call_timeout_ms() -> u64 {
    2000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_formats() -> Vec<ExportFormat> {
    vec![ExportFormat::Txt, ExportFormat::Csv]
}

fn default_incremental_every() -> u64 {
    1
}

fn default_export_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            run_timeout_secs: default_run_timeout_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            max_consecutive_read_failures: default_max_consecutive_read_failures(),
            step_origin: 0,
            byte_offset: 0,
            sink_queue_capacity: default_sink_queue_capacity(),
            finalize_timeout_secs: default_finalize_timeout_secs(),
            record_final_dwell: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            csv_dir: default_csv_dir(),
            fallback_path: default_fallback_path(),
            call_timeout_ms: default_call_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            formats: default_formats(),
            dated_subdir: true,
            incremental_every: default_incremental_every(),
            file_prefix: None,
            write_timeout_ms: default_export_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Load from `path` (or [`DEFAULT_CONFIG_PATH`]) and `PULSE_DAQ_*` variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load(path: Option<&Path>) -> Result<Self, DaqError> {
        Self::figment(path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH)))
            .extract()
            .map_err(DaqError::from)
    }

    /// Provider chain used by [`Settings::load`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate semantic constraints after loading.
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if acq.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.poll_interval_ms must be greater than 0".into(),
            ));
        }
        if acq.read_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "acquisition.read_timeout_ms must be greater than 0".into(),
            ));
        }
        if acq.max_consecutive_read_failures == 0 {
            return Err(DaqError::Configuration(
                "acquisition.max_consecutive_read_failures must be greater than 0".into(),
            ));
        }
        if acq.sink_queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "acquisition.sink_queue_capacity must be greater than 0".into(),
            ));
        }
        StepOrigin::try_from(acq.step_origin).map_err(DaqError::Configuration)?;

        for (section, policy) in [("storage", &self.storage.retry), ("export", &self.export.retry)] {
            if policy.max_attempts == 0 {
                return Err(DaqError::Configuration(format!(
                    "{section}.retry.max_attempts must be at least 1"
                )));
            }
        }

        if self.export.formats.is_empty() {
            return Err(DaqError::Configuration(
                "export.formats must name at least one format".into(),
            ));
        }

        Ok(())
    }
}

impl AcquisitionSettings {
    /// Poll cadence.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Run length.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Single read deadline.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Bound on the end-of-run work.
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_secs(self.finalize_timeout_secs)
    }

    /// Configured step origin; invalid values fall back to zero (rejected by `validate`).
    pub fn origin(&self) -> StepOrigin {
        StepOrigin::try_from(self.step_origin).unwrap_or_default()
    }
}

impl StorageSettings {
    /// Single gateway call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl ExportSettings {
    /// Single export attempt deadline.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// File layout for these settings.
    pub fn layout(&self) -> ExportLayout {
        ExportLayout {
            output_dir: self.output_dir.clone(),
            dated_subdir: self.dated_subdir,
            prefix: self.file_prefix.clone(),
        }
    }
}
