//! Flat-file storage adapter: CSV tables and TOML configuration in one directory.
//!
//! Layout:
//!
//! ```text
//! <dir>/experiments.toml            [[experiment]] tables (ExperimentConfig)
//! <dir>/ground_truth.toml           [[pattern]] tables (GroundTruthPattern)
//! <dir>/dadoscoletados2.csv         one row per step
//! <dir>/dadoscoletados_summary.csv  one row per finished run
//! ```
//!
//! Rows are only ever appended. A single mutex serialises all file access, so
//! concurrent callers cannot interleave partial rows. A step is keyed by
//! `(experiment_id, step)` and a summary by its full contents; inserting a key that is
//! already on disk is a no-op. A call that only gets the lock after its deadline gives
//! up without touching the files.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::hash::Hash;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use super::{ExperimentConfig, GroundTruthPattern, StorageError, StorageGateway};
use crate::pulse_train::{PulseTrainSummary, StepRecord};

const EXPERIMENTS_FILE: &str = "experiments.toml";
const GROUND_TRUTH_FILE: &str = "ground_truth.toml";
const STEPS_FILE: &str = "dadoscoletados2.csv";
const SUMMARY_FILE: &str = "dadoscoletados_summary.csv";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExperimentsFile {
    #[serde(default, rename = "experiment")]
    experiments: Vec<ExperimentConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GroundTruthFile {
    #[serde(default, rename = "pattern")]
    patterns: Vec<GroundTruthPattern>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StepRow {
    id: i64,
    #[serde(rename = "experimentName")]
    experiment_name: String,
    experiment_id: i64,
    step: u64,
    pulse_train: String,
    pulse_value: u32,
    #[serde(rename = "timeToChange")]
    time_to_change: f64,
    time_stamp: i64,
    float_value: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct SummaryRow {
    id: i64,
    experiment_id: i64,
    pattern: String,
    time_stamp: i64,
}

/// Next row id and the keys already present in one table.
#[derive(Debug)]
struct TableIndex<K> {
    next_id: i64,
    keys: HashSet<K>,
}

impl<K: Eq + Hash> TableIndex<K> {
    /// Build from the rows on disk (cached after the first call).
    fn load<'a, T: DeserializeOwned>(
        slot: &'a mut Option<Self>,
        path: &Path,
        id_of: fn(&T) -> i64,
        key_of: fn(T) -> K,
    ) -> Result<&'a mut Self, StorageError> {
        if slot.is_none() {
            let rows: Vec<T> = read_rows(path)?;
            let next_id = rows.iter().map(id_of).max().unwrap_or(0) + 1;
            *slot = Some(Self {
                next_id,
                keys: rows.into_iter().map(key_of).collect(),
            });
        }
        slot.as_mut()
            .ok_or_else(|| StorageError::Unavailable("table index not loaded".into()))
    }

    /// Claim an id for `key`, or `None` when the row already exists.
    fn claim(&mut self, key: K) -> Option<i64> {
        if !self.keys.insert(key) {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(id)
    }

    /// Undo a claim whose row was never written.
    fn release(&mut self, key: &K) {
        self.keys.remove(key);
    }
}

type StepKey = (i64, u64);
type SummaryKey = (i64, String, i64);

#[derive(Debug, Default)]
struct RowIds {
    steps: Option<TableIndex<StepKey>>,
    summaries: Option<TableIndex<SummaryKey>>,
    last_experiment: i64,
}

/// Gateway backed by a directory of CSV and TOML files.
#[derive(Clone)]
pub struct CsvDirectoryGateway {
    dir: PathBuf,
    ids: Arc<Mutex<RowIds>>,
    call_timeout: Duration,
}

impl CsvDirectoryGateway {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ids: Arc::new(Mutex::new(RowIds::default())),
            call_timeout: Duration::from_secs(5),
        })
    }

    /// Bound every call, including the wait for the file lock, to `limit`.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn with_files<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Path, &mut RowIds) -> Result<T, StorageError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let ids = Arc::clone(&self.ids);
        let limit = self.call_timeout;
        let deadline = Instant::now() + limit;
        tokio::task::spawn_blocking(move || {
            let mut guard = ids
                .lock()
                .map_err(|_| StorageError::Unavailable("CSV storage lock poisoned".into()))?;
            if Instant::now() >= deadline {
                debug!(timeout_ms = limit.as_millis() as u64, "CSV call expired before it ran");
                return Err(StorageError::Timeout(limit.as_millis() as u64));
            }
            f(&dir, &mut guard)
        })
        .await?
    }
}

fn read_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text).map_err(|e| StorageError::Serialization(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let text = toml::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(text.as_bytes())?;
    staged.as_file().sync_all()?;
    staged.persist(path).map_err(|e| StorageError::from(e.error))?;
    Ok(())
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            if let csv::ErrorKind::Io(io) = e.kind() {
                if io.kind() == std::io::ErrorKind::NotFound {
                    return Ok(Vec::new());
                }
            }
            return Err(e.into());
        }
    };
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(StorageError::from)
}

fn append_row<T: Serialize>(path: &Path, row: &T) -> Result<(), StorageError> {
    let needs_header = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

/// Append the row built for `key` unless that key is already stored.
fn append_once<K, R>(
    index: &mut TableIndex<K>,
    path: &Path,
    key: K,
    build: impl FnOnce(i64) -> R,
) -> Result<(), StorageError>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    R: Serialize,
{
    let Some(id) = index.claim(key.clone()) else {
        debug!(?key, path = %path.display(), "Row already stored, insert skipped");
        return Ok(());
    };
    let written = append_row(path, &build(id));
    if written.is_err() {
        index.release(&key);
    }
    written
}

#[async_trait]
impl StorageGateway for CsvDirectoryGateway {
    fn backend_name(&self) -> &'static str {
        "csv"
    }

    async fn get_config(&self, experiment_name: &str) -> Result<ExperimentConfig, StorageError> {
        let name = experiment_name.to_string();
        self.with_files(move |dir, _| {
            let file: ExperimentsFile = read_toml(&dir.join(EXPERIMENTS_FILE))?;
            file.experiments
                .into_iter()
                .find(|c| c.name == name)
                .ok_or(StorageError::NotFound(name))
        })
        .await
    }

    async fn list_experiments(&self) -> Result<Vec<String>, StorageError> {
        self.with_files(|dir, _| {
            let file: ExperimentsFile = read_toml(&dir.join(EXPERIMENTS_FILE))?;
            let mut names: Vec<String> = file.experiments.into_iter().map(|c| c.name).collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn upsert_config(&self, config: &ExperimentConfig) -> Result<(), StorageError> {
        let config = config.clone();
        self.with_files(move |dir, _| {
            let path = dir.join(EXPERIMENTS_FILE);
            let mut file: ExperimentsFile = read_toml(&path)?;
            match file.experiments.iter_mut().find(|c| c.name == config.name) {
                Some(existing) => *existing = config,
                None => file.experiments.push(config),
            }
            write_toml(&path, &file)
        })
        .await
    }

    async fn next_experiment_id(&self) -> Result<i64, StorageError> {
        self.with_files(|dir, ids| {
            let steps: Vec<StepRow> = read_rows(&dir.join(STEPS_FILE))?;
            let summaries: Vec<SummaryRow> = read_rows(&dir.join(SUMMARY_FILE))?;
            let max = steps
                .iter()
                .map(|r| r.experiment_id)
                .chain(summaries.iter().map(|r| r.experiment_id))
                .max()
                .unwrap_or(0);
            // Ids handed to runs that have not written anything yet are taken too.
            ids.last_experiment = ids.last_experiment.max(max) + 1;
            Ok(ids.last_experiment)
        })
        .await
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<(), StorageError> {
        let r = record.clone();
        self.with_files(move |dir, ids| {
            let path = dir.join(STEPS_FILE);
            let index = TableIndex::load::<StepRow>(
                &mut ids.steps,
                &path,
                |row| row.id,
                |row| (row.experiment_id, row.step),
            )?;
            let key = (r.experiment_id, r.step);
            append_once(index, &path, key, |id| StepRow {
                id,
                experiment_name: r.experiment_name,
                experiment_id: r.experiment_id,
                step: r.step,
                pulse_train: r.pattern,
                pulse_value: r.step_value,
                time_to_change: r.time_to_change_s,
                time_stamp: r.timestamp_ms,
                float_value: r.float_value,
            })
        })
        .await
    }

    async fn insert_summary(&self, summary: &PulseTrainSummary) -> Result<(), StorageError> {
        let s = summary.clone();
        self.with_files(move |dir, ids| {
            let path = dir.join(SUMMARY_FILE);
            let index = TableIndex::load::<SummaryRow>(
                &mut ids.summaries,
                &path,
                |row| row.id,
                |row| (row.experiment_id, row.pattern, row.time_stamp),
            )?;
            let key = (s.experiment_id, s.pattern.clone(), s.timestamp_ms);
            append_once(index, &path, key, |id| SummaryRow {
                id,
                experiment_id: s.experiment_id,
                pattern: s.pattern,
                time_stamp: s.timestamp_ms,
            })
        })
        .await
    }

    async fn get_pulse_values(&self, experiment_id: i64) -> Result<Vec<u32>, StorageError> {
        self.with_files(move |dir, _| {
            let mut rows: Vec<StepRow> = read_rows(&dir.join(STEPS_FILE))?;
            rows.retain(|r| r.experiment_id == experiment_id);
            rows.sort_by_key(|r| (r.step, r.id));
            Ok(rows.into_iter().map(|r| r.pulse_value).collect())
        })
        .await
    }

    async fn get_summary(&self, experiment_id: i64) -> Result<Option<PulseTrainSummary>, StorageError> {
        self.with_files(move |dir, _| {
            let rows: Vec<SummaryRow> = read_rows(&dir.join(SUMMARY_FILE))?;
            Ok(rows
                .into_iter()
                .filter(|r| r.experiment_id == experiment_id)
                .max_by_key(|r| r.id)
                .map(|r| PulseTrainSummary {
                    experiment_id: r.experiment_id,
                    pattern: r.pattern,
                    timestamp_ms: r.time_stamp,
                }))
        })
        .await
    }

    async fn get_ground_truth(
        &self,
        experiment_name: &str,
    ) -> Result<Option<GroundTruthPattern>, StorageError> {
        let name = experiment_name.to_string();
        self.with_files(move |dir, _| {
            let file: GroundTruthFile = read_toml(&dir.join(GROUND_TRUTH_FILE))?;
            Ok(file.patterns.into_iter().find(|p| p.experiment_name == name))
        })
        .await
    }

    async fn upsert_ground_truth(&self, pattern: &GroundTruthPattern) -> Result<(), StorageError> {
        let pattern = pattern.clone();
        self.with_files(move |dir, _| {
            let path = dir.join(GROUND_TRUTH_FILE);
            let mut file: GroundTruthFile = read_toml(&path)?;
            match file
                .patterns
                .iter_mut()
                .find(|p| p.experiment_name == pattern.experiment_name)
            {
                Some(existing) => *existing = pattern,
                None => file.patterns.push(pattern),
            }
            write_toml(&path, &file)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rows_are_appended_with_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirectoryGateway::open(dir.path()).unwrap();
        for step in 0..3u64 {
            store
                .insert_step(&StepRecord {
                    experiment_name: "press".into(),
                    experiment_id: 1,
                    step,
                    pattern: "[true,false]".into(),
                    step_value: step as u32,
                    time_to_change_s: 0.2,
                    timestamp_ms: 10,
                    float_value: 0.2,
                    closing: false,
                })
                .await
                .unwrap();
        }

        let text = std::fs::read_to_string(dir.path().join(STEPS_FILE)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("id,experimentName,experiment_id,step"));
        assert!(lines[3].starts_with("3,press,1,2,"));
        assert_eq!(store.get_pulse_values(1).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn row_ids_continue_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let summary = PulseTrainSummary {
            experiment_id: 2,
            pattern: "[1]".into(),
            timestamp_ms: 5,
        };
        CsvDirectoryGateway::open(dir.path())
            .unwrap()
            .insert_summary(&summary)
            .await
            .unwrap();

        let reopened = CsvDirectoryGateway::open(dir.path()).unwrap();
        reopened
            .insert_summary(&PulseTrainSummary {
                pattern: "[1,2]".into(),
                ..summary
            })
            .await
            .unwrap();

        let latest = reopened.get_summary(2).await.unwrap().unwrap();
        assert_eq!(latest.pattern, "[1,2]");
        assert_eq!(reopened.next_experiment_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn experiments_file_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirectoryGateway::open(dir.path()).unwrap();
        assert!(store.list_experiments().await.unwrap().is_empty());

        for name in ["sorter", "press"] {
            store
                .upsert_config(&ExperimentConfig {
                    name: name.into(),
                    host: "10.0.0.5".into(),
                    rack: 0,
                    slot: 2,
                    db_number: 1,
                    num_inputs: 4,
                    num_outputs: 4,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.list_experiments().await.unwrap(), vec!["press", "sorter"]);
        assert_eq!(store.get_config("sorter").await.unwrap().slot, 2);

        let text = std::fs::read_to_string(dir.path().join(EXPERIMENTS_FILE)).unwrap();
        assert!(text.contains("[[experiment]]"));
    }

    #[tokio::test]
    async fn repeated_inserts_keep_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let step = StepRecord {
            experiment_name: "press".into(),
            experiment_id: 3,
            step: 0,
            pattern: "[true]".into(),
            step_value: 1,
            time_to_change_s: 0.1,
            timestamp_ms: 10,
            float_value: 0.1,
            closing: false,
        };
        let summary = PulseTrainSummary {
            experiment_id: 3,
            pattern: "[1]".into(),
            timestamp_ms: 11,
        };

        let store = CsvDirectoryGateway::open(dir.path()).unwrap();
        store.insert_step(&step).await.unwrap();
        store.insert_step(&step).await.unwrap();
        store.insert_summary(&summary).await.unwrap();

        // a fresh handle rebuilds the keys from disk
        let reopened = CsvDirectoryGateway::open(dir.path()).unwrap();
        reopened.insert_step(&step).await.unwrap();
        reopened.insert_summary(&summary).await.unwrap();

        assert_eq!(reopened.get_pulse_values(3).await.unwrap(), vec![1]);
        let summaries = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert_eq!(summaries.lines().count(), 2);
    }

    #[tokio::test]
    async fn call_that_waits_past_its_deadline_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvDirectoryGateway::open(dir.path())
            .unwrap()
            .with_call_timeout(Duration::from_millis(50));

        let ids = Arc::clone(&store.ids);
        let blocker = tokio::task::spawn_blocking(move || {
            let _held = ids.lock().unwrap();
            std::thread::sleep(Duration::from_millis(200));
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let summary = PulseTrainSummary {
            experiment_id: 1,
            pattern: "[]".into(),
            timestamp_ms: 0,
        };
        assert_eq!(store.insert_summary(&summary).await, Err(StorageError::Timeout(50)));
        blocker.await.unwrap();
        assert!(!dir.path().join(SUMMARY_FILE).exists());
    }
}
