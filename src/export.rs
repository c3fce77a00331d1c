//! Versioned snapshot files (`.txt` / `.csv`) for acquisition runs.
//!
//! Every call to [`VersionedExporter::export`] creates a new file. The first file for a
//! base name takes the bare name (`mixer_4.csv`); later files take a strictly higher
//! version suffix (`mixer_4_v1.csv`, `mixer_4_v2.csv`, ...) than anything already on
//! disk. Content is written to a temporary file in the target directory and then
//! linked into place without clobbering, so a crash mid-write never leaves a partial
//! file under a final name and an existing file is never replaced.
//!
//! Exports run on the blocking pool, where a timed-out attempt keeps running.
//! [`VersionedExporter::export_before`] checks its deadline right before the file is
//! linked into place, so an abandoned attempt does not publish an extra version.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::pulse_train::StepRecord;
use crate::retry::TimeoutError;

/// Number of times a name collision is re-resolved before giving up.
const MAX_COLLISIONS: u32 = 16;

/// Export failures.
#[derive(Error, Debug)]
pub enum ExportError {
    /// Target directory cannot be created or written.
    #[error("export directory '{dir}' unavailable: {source}")]
    StorageUnavailable {
        /// Directory that could not be used.
        dir: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Writing or linking the file failed.
    #[error("failed to write '{path}': {source}")]
    Write {
        /// Final path being written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Content could not be rendered.
    #[error("failed to render export: {0}")]
    Render(String),

    /// Concurrent writers kept taking the candidate name.
    #[error("could not claim a free version for '{0}'")]
    VersionContention(String),

    /// The export did not finish in time.
    #[error("export timed out after {0} ms")]
    Timeout(u64),

    /// The deadline passed before the file was linked into place; nothing was published.
    #[error("export of '{0}' abandoned at its deadline")]
    Abandoned(String),
}

impl TimeoutError for ExportError {
    fn timed_out(after: Duration) -> Self {
        ExportError::Timeout(after.as_millis() as u64)
    }
}

impl From<csv::Error> for ExportError {
    fn from(value: csv::Error) -> Self {
        ExportError::Render(value.to_string())
    }
}

/// Export file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Human-readable step log.
    Txt,
    /// One row per step.
    Csv,
}

impl ExportFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Txt => "txt",
            ExportFormat::Csv => "csv",
        }
    }

    /// Render `records` in this format.
    pub fn render(self, io_labels: &[String], records: &[StepRecord]) -> Result<Vec<u8>, ExportError> {
        match self {
            ExportFormat::Txt => Ok(render_txt(io_labels, records).into_bytes()),
            ExportFormat::Csv => render_csv(records),
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Writes versioned files into one directory.
#[derive(Debug, Clone)]
pub struct VersionedExporter {
    dir: PathBuf,
}

impl VersionedExporter {
    /// Exporter writing into `dir` (created on first export).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Target directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `content` to the next free version of `base_name.<ext>` and return its path.
    pub fn export(
        &self,
        base_name: &str,
        format: ExportFormat,
        content: &[u8],
    ) -> Result<PathBuf, ExportError> {
        self.publish(base_name, format, content, None)
    }

    /// Like [`VersionedExporter::export`], but publishes nothing once `deadline` has passed.
    pub fn export_before(
        &self,
        base_name: &str,
        format: ExportFormat,
        content: &[u8],
        deadline: Instant,
    ) -> Result<PathBuf, ExportError> {
        self.publish(base_name, format, content, Some(deadline))
    }

    fn publish(
        &self,
        base_name: &str,
        format: ExportFormat,
        content: &[u8],
        deadline: Option<Instant>,
    ) -> Result<PathBuf, ExportError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ExportError::StorageUnavailable {
            dir: self.dir.clone(),
            source,
        })?;

        let mut staged = tempfile::Builder::new()
            .prefix(".export-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|source| ExportError::StorageUnavailable {
                dir: self.dir.clone(),
                source,
            })?;

        let path_for_errors = self.dir.join(file_name(base_name, format, None));
        staged
            .write_all(content)
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|source| ExportError::Write {
                path: path_for_errors,
                source,
            })?;

        for _ in 0..MAX_COLLISIONS {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                // dropping the staged file removes it
                return Err(ExportError::Abandoned(base_name.to_string()));
            }
            let version = self.next_version(base_name, format)?;
            let path = self.dir.join(file_name(base_name, format, version));
            match staged.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), bytes = content.len(), "Export written");
                    return Ok(path);
                }
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists => {
                    staged = err.file;
                }
                Err(err) => {
                    return Err(ExportError::Write {
                        path,
                        source: err.error,
                    })
                }
            }
        }

        Err(ExportError::VersionContention(base_name.to_string()))
    }

    /// Version to use for the next file: `None` for the bare name, else one above the
    /// highest version found on disk.
    fn next_version(&self, base_name: &str, format: ExportFormat) -> Result<Option<u32>, ExportError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| ExportError::StorageUnavailable {
            dir: self.dir.clone(),
            source,
        })?;

        let mut highest: Option<u32> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(version) = parse_version(name, base_name, format) {
                highest = Some(highest.map_or(version, |h| h.max(version)));
            }
        }

        Ok(highest.map(|h| h + 1))
    }
}

/// `base.ext` for version `None`, `base_vN.ext` otherwise.
fn file_name(base_name: &str, format: ExportFormat, version: Option<u32>) -> String {
    match version {
        None => format!("{base_name}.{}", format.extension()),
        Some(v) => format!("{base_name}_v{v}.{}", format.extension()),
    }
}

/// Version of `name` if it belongs to `base_name` (bare name counts as 0).
fn parse_version(name: &str, base_name: &str, format: ExportFormat) -> Option<u32> {
    let stem = name
        .strip_prefix(base_name)?
        .strip_suffix(format.extension())?
        .strip_suffix('.')?;
    if stem.is_empty() {
        return Some(0);
    }
    let digits = stem.strip_prefix("_v")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Where a run's exports go and what they are called.
#[derive(Debug, Clone)]
pub struct ExportLayout {
    /// Root output directory.
    pub output_dir: PathBuf,
    /// Put files in a `YYYY-MM-DD` sub-directory.
    pub dated_subdir: bool,
    /// Optional prefix for every base name (e.g. the operator role).
    pub prefix: Option<String>,
}

impl ExportLayout {
    /// Directory for exports made today.
    pub fn target_dir(&self) -> PathBuf {
        if self.dated_subdir {
            self.output_dir
                .join(Local::now().format("%Y-%m-%d").to_string())
        } else {
            self.output_dir.clone()
        }
    }

    /// Base name for a run: `[<prefix>_]<experiment>_<id>`.
    pub fn base_name(&self, experiment: &str, experiment_id: i64) -> String {
        let experiment = sanitize(experiment);
        match self.prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{}_{experiment}_{experiment_id}", sanitize(prefix)),
            None => format!("{experiment}_{experiment_id}"),
        }
    }
}

/// Keep file names portable.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// IO labels `in1..inN, out1..outM`.
pub fn io_labels(num_inputs: u8, num_outputs: u8) -> Vec<String> {
    (1..=num_inputs)
        .map(|i| format!("in{i}"))
        .chain((1..=num_outputs).map(|i| format!("out{i}")))
        .collect()
}

fn render_txt(io_labels: &[String], records: &[StepRecord]) -> String {
    let mut out = format!("IOs: [{}]\n", io_labels.join(", "));
    for r in records {
        out.push_str(&format!(
            "Step{}: {} | value: {} | duration (s): {:.3} | timestamp: {}{}\n",
            r.step,
            r.pattern,
            r.step_value,
            r.time_to_change_s,
            r.timestamp_ms,
            if r.closing { " | closing" } else { "" },
        ));
    }
    out
}

fn render_csv(records: &[StepRecord]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["step", "pattern", "step_value", "time_to_change_s", "timestamp_ms"])?;
    for r in records {
        writer.write_record(&[
            r.step.to_string(),
            r.pattern.clone(),
            r.step_value.to_string(),
            format!("{:.6}", r.time_to_change_s),
            r.timestamp_ms.to_string(),
        ])?;
    }
    writer
        .into_inner()
        .map_err(|e| ExportError::Render(e.to_string()))
}
