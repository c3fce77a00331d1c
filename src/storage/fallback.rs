//! Local fallback buffer for records the gateway could not take.
//!
//! Entries are appended as JSON lines. Buffering defers data loss instead of hiding
//! it: the run report counts buffered entries, and [`FallbackBuffer::replay`] pushes
//! them back into a gateway once storage is reachable again. Gateway inserts are
//! idempotent, so an entry that also reached storage replays as a no-op.
//!
//! Every buffer opened on the same path in one process shares one lock, so several
//! acquisition loops can append to the configured file at the same time.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{StorageError, StorageGateway};
use crate::pulse_train::{PulseTrainSummary, StepRecord};

/// A record waiting to be written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackEntry {
    /// A `dadoscoletados2` row.
    Step(StepRecord),
    /// A `dadoscoletados_summary` row.
    Summary(PulseTrainSummary),
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Entries written to the gateway.
    pub replayed: usize,
    /// Entries that failed again and remain buffered.
    pub remaining: usize,
    /// Unreadable lines moved aside to the `.rejected` file.
    pub rejected: usize,
}

/// Append-only JSON-lines file shared by all streams of a process.
#[derive(Debug, Clone)]
pub struct FallbackBuffer {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

/// One lock per buffer file for the whole process.
fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

    let key = if path.is_relative() {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    };
    let mut locks = match LOCKS.get_or_init(Default::default).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    Arc::clone(locks.entry(key).or_default())
}

/// Parsed entries plus the raw lines that did not parse.
struct Contents {
    entries: Vec<FallbackEntry>,
    rejected: Vec<String>,
}

impl FallbackBuffer {
    /// Buffer stored at `path` (created on first push).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = lock_for(&path);
        Self { path, lock }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling file collecting lines that could not be parsed.
    pub fn rejected_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".rejected");
        self.path.with_file_name(name)
    }

    /// Append one entry.
    pub fn push(&self, entry: &FallbackEntry) -> Result<(), StorageError> {
        self.push_all(std::slice::from_ref(entry))
    }

    /// Append several entries with a single write.
    pub fn push_all(&self, entries: &[FallbackEntry]) -> Result<(), StorageError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut block = String::new();
        for entry in entries {
            block.push_str(&serde_json::to_string(entry)?);
            block.push('\n');
        }

        let _guard = self.lock()?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(block.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Entries currently buffered, oldest first. Unreadable lines are skipped.
    pub fn pending(&self) -> Result<Vec<FallbackEntry>, StorageError> {
        let _guard = self.lock()?;
        Ok(self.read_all()?.entries)
    }

    /// Write buffered entries to `gateway`, keeping the ones that still fail.
    pub async fn replay(&self, gateway: &dyn StorageGateway) -> Result<ReplayStats, StorageError> {
        let entries = self.pending()?;
        if entries.is_empty() {
            return Ok(ReplayStats::default());
        }
        let taken = entries.len();
        let mut failed = Vec::new();
        let mut stats = ReplayStats::default();

        for entry in entries {
            let result = match &entry {
                FallbackEntry::Step(record) => gateway.insert_step(record).await,
                FallbackEntry::Summary(summary) => gateway.insert_summary(summary).await,
            };
            match result {
                Ok(()) => stats.replayed += 1,
                Err(err) => {
                    warn!(error = %err, "Replay of buffered entry failed");
                    failed.push(entry);
                }
            }
        }

        stats.remaining = failed.len();
        stats.rejected = self.rewrite(failed, taken)?;
        info!(
            replayed = stats.replayed,
            remaining = stats.remaining,
            rejected = stats.rejected,
            path = %self.path.display(),
            "Fallback buffer replayed"
        );
        Ok(stats)
    }

    /// Replace the first `taken` entries with `kept`; entries pushed since stay at the end.
    ///
    /// Unreadable lines move to [`FallbackBuffer::rejected_path`]. Returns how many moved.
    fn rewrite(&self, mut kept: Vec<FallbackEntry>, taken: usize) -> Result<usize, StorageError> {
        let _guard = self.lock()?;
        let contents = self.read_all()?;
        kept.extend(contents.entries.into_iter().skip(taken));

        if !contents.rejected.is_empty() {
            let mut aside = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.rejected_path())?;
            let mut block = contents.rejected.join("\n");
            block.push('\n');
            aside.write_all(block.as_bytes())?;
            aside.sync_data()?;
        }

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(dir)?;
        for entry in &kept {
            writeln!(staged, "{}", serde_json::to_string(entry)?)?;
        }
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|e| StorageError::from(e.error))?;
        Ok(contents.rejected.len())
    }

    fn read_all(&self) -> Result<Contents, StorageError> {
        let mut contents = Contents {
            entries: Vec::new(),
            rejected: Vec::new(),
        };
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(contents),
            Err(e) => return Err(e.into()),
        };
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => contents.entries.push(entry),
                Err(err) => {
                    warn!(line = index + 1, error = %err, path = %self.path.display(), "Skipping unreadable fallback entry");
                    contents.rejected.push(line);
                }
            }
        }
        Ok(contents)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StorageError> {
        self.lock
            .lock()
            .map_err(|_| StorageError::Unavailable("fallback buffer lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteGateway;

    fn step(step: u64) -> FallbackEntry {
        FallbackEntry::Step(StepRecord {
            experiment_name: "press".into(),
            experiment_id: 1,
            step,
            pattern: "[true]".into(),
            step_value: 1,
            time_to_change_s: 0.0,
            timestamp_ms: 0,
            float_value: 0.0,
            closing: false,
        })
    }

    #[test]
    fn entries_survive_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = FallbackBuffer::new(dir.path().join("pending/fallback.jsonl"));
        assert!(buffer.pending().unwrap().is_empty());

        buffer.push(&step(0)).unwrap();
        buffer.push(&step(1)).unwrap();
        assert_eq!(buffer.pending().unwrap(), vec![step(0), step(1)]);

        let text = std::fs::read_to_string(buffer.path()).unwrap();
        assert!(text.lines().all(|l| l.contains("\"kind\":\"step\"")));
    }

    #[tokio::test]
    async fn replay_empties_buffer_when_storage_is_back() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = FallbackBuffer::new(dir.path().join("fallback.jsonl"));
        buffer.push(&step(0)).unwrap();
        buffer.push(&step(1)).unwrap();

        let db = SqliteGateway::in_memory().unwrap();
        let stats = buffer.replay(&db).await.unwrap();
        assert_eq!(stats, ReplayStats { replayed: 2, remaining: 0, rejected: 0 });
        assert!(buffer.pending().unwrap().is_empty());
        assert_eq!(db.get_pulse_values(1).await.unwrap(), vec![1, 1]);
    }

    #[test]
    fn buffers_on_one_path_never_interleave_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.jsonl");

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let buffer = FallbackBuffer::new(&path);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buffer.push(&step(w * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let pending = FallbackBuffer::new(&path).pending().unwrap();
        assert_eq!(pending.len(), 400);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 400);
    }

    #[tokio::test]
    async fn corrupt_line_is_set_aside_and_the_rest_replays() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = FallbackBuffer::new(dir.path().join("fallback.jsonl"));
        buffer.push(&step(0)).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(buffer.path()).unwrap();
            file.write_all(b"{\"kind\":\"step\",\"experi\n").unwrap();
        }
        buffer.push(&step(1)).unwrap();

        assert_eq!(buffer.pending().unwrap(), vec![step(0), step(1)]);

        let db = SqliteGateway::in_memory().unwrap();
        let stats = buffer.replay(&db).await.unwrap();
        assert_eq!(stats, ReplayStats { replayed: 2, remaining: 0, rejected: 1 });
        assert!(buffer.pending().unwrap().is_empty());
        let aside = std::fs::read_to_string(buffer.rejected_path()).unwrap();
        assert!(aside.starts_with("{\"kind\":\"step\",\"experi"));
    }

    #[tokio::test]
    async fn replaying_an_entry_storage_already_has_adds_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = FallbackBuffer::new(dir.path().join("fallback.jsonl"));
        let db = SqliteGateway::in_memory().unwrap();
        if let FallbackEntry::Step(record) = step(0) {
            db.insert_step(&record).await.unwrap();
        }
        buffer.push(&step(0)).unwrap();

        buffer.replay(&db).await.unwrap();
        assert_eq!(db.get_pulse_values(1).await.unwrap(), vec![1]);
    }
}
