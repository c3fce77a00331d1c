//! SQLite storage adapter.
//!
//! One connection guarded by a mutex; every call runs on the blocking pool so the
//! async caller never waits on disk I/O directly. A blocking call cannot be cancelled
//! from the async side, so each call carries its own deadline: it gives up if it only
//! gets the connection after the deadline, and SQLite's busy handler waits no longer
//! than what is left. Step and summary inserts are idempotent, so a late attempt that
//! still commits never adds a second row.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::{ExperimentConfig, GroundTruthPattern, StorageError, StorageGateway};
use crate::pulse_train::{PulseTrainSummary, StepRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS plant_config (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_name TEXT NOT NULL UNIQUE,
    ip_profinet TEXT NOT NULL,
    rack_profinet INTEGER NOT NULL,
    slot_profinet INTEGER NOT NULL,
    db_number_profinet INTEGER NOT NULL,
    num_of_inputs INTEGER NOT NULL,
    num_of_outputs INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS ground_truth_patterns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_name TEXT NOT NULL UNIQUE,
    ground_truth TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS dadoscoletados2 (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experimentName TEXT,
    experiment_id INTEGER NOT NULL,
    step INTEGER NOT NULL,
    pulse_train TEXT,
    pulse_value INTEGER,
    timeToChange REAL,
    time_stamp INTEGER,
    float_value REAL
);
CREATE TABLE IF NOT EXISTS dadoscoletados_summary (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    experiment_id INTEGER NOT NULL,
    pattern TEXT NOT NULL,
    time_stamp INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS dadoscoletados2_run_step
    ON dadoscoletados2 (experiment_id, step);
CREATE UNIQUE INDEX IF NOT EXISTS dadoscoletados_summary_entry
    ON dadoscoletados_summary (experiment_id, pattern, time_stamp);
";

/// Deadline of a call when none is configured.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    // Highest experiment id handed out by this process, so concurrent runs never share one.
    last_issued: Arc<AtomicI64>,
    call_timeout: Duration,
}

impl SqliteGateway {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Self::from_connection(conn, path)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "SQLite storage ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            last_issued: Arc::new(AtomicI64::new(0)),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Bound every call (connection wait plus SQLite busy wait) to `limit`.
    pub fn with_call_timeout(mut self, limit: Duration) -> Self {
        self.call_timeout = limit;
        self
    }

    /// Database location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let limit = self.call_timeout;
        let deadline = Instant::now() + limit;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("SQLite connection lock poisoned".into()))?;
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                debug!(timeout_ms = limit.as_millis() as u64, "SQLite call expired before it ran");
                return Err(StorageError::Timeout(limit.as_millis() as u64));
            }
            guard.busy_timeout(left)?;
            f(&guard)
        })
        .await?
    }
}

fn config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentConfig> {
    Ok(ExperimentConfig {
        name: row.get(0)?,
        host: row.get(1)?,
        rack: row.get(2)?,
        slot: row.get(3)?,
        db_number: row.get(4)?,
        num_inputs: row.get(5)?,
        num_outputs: row.get(6)?,
    })
}

#[async_trait]
impl StorageGateway for SqliteGateway {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn get_config(&self, experiment_name: &str) -> Result<ExperimentConfig, StorageError> {
        let name = experiment_name.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT experiment_name, ip_profinet, rack_profinet, slot_profinet, \
                 db_number_profinet, num_of_inputs, num_of_outputs \
                 FROM plant_config WHERE experiment_name = ?1",
                params![name],
                config_from_row,
            )
            .optional()?
            .ok_or(StorageError::NotFound(name))
        })
        .await
    }

    async fn list_experiments(&self) -> Result<Vec<String>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT experiment_name FROM plant_config ORDER BY experiment_name ASC")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn upsert_config(&self, config: &ExperimentConfig) -> Result<(), StorageError> {
        let config = config.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO plant_config (experiment_name, ip_profinet, rack_profinet, \
                 slot_profinet, db_number_profinet, num_of_inputs, num_of_outputs) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(experiment_name) DO UPDATE SET \
                 ip_profinet = excluded.ip_profinet, rack_profinet = excluded.rack_profinet, \
                 slot_profinet = excluded.slot_profinet, \
                 db_number_profinet = excluded.db_number_profinet, \
                 num_of_inputs = excluded.num_of_inputs, num_of_outputs = excluded.num_of_outputs",
                params![
                    config.name,
                    config.host,
                    config.rack,
                    config.slot,
                    config.db_number,
                    config.num_inputs,
                    config.num_outputs
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn next_experiment_id(&self) -> Result<i64, StorageError> {
        let stored_max = self
            .with_conn(|conn| {
                let max: Option<i64> = conn.query_row(
                    "SELECT MAX(id) FROM (SELECT MAX(experiment_id) AS id FROM dadoscoletados2 \
                     UNION ALL SELECT MAX(experiment_id) FROM dadoscoletados_summary)",
                    [],
                    |row| row.get(0),
                )?;
                Ok(max.unwrap_or(0))
            })
            .await?;

        let issue = |last: i64| last.max(stored_max) + 1;
        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(issue(last)))
            .unwrap_or_else(|last| last);
        Ok(issue(previous))
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<(), StorageError> {
        let r = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO dadoscoletados2 (experimentName, experiment_id, step, pulse_train, \
                 pulse_value, timeToChange, time_stamp, float_value) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    r.experiment_name,
                    r.experiment_id,
                    r.step as i64,
                    r.pattern,
                    r.step_value,
                    r.time_to_change_s,
                    r.timestamp_ms,
                    r.float_value
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_summary(&self, summary: &PulseTrainSummary) -> Result<(), StorageError> {
        let s = summary.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO dadoscoletados_summary (experiment_id, pattern, time_stamp) \
                 VALUES (?1, ?2, ?3)",
                params![s.experiment_id, s.pattern, s.timestamp_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_pulse_values(&self, experiment_id: i64) -> Result<Vec<u32>, StorageError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pulse_value FROM dadoscoletados2 WHERE experiment_id = ?1 \
                 ORDER BY step ASC, id ASC",
            )?;
            let values = stmt
                .query_map(params![experiment_id], |row| row.get(0))?
                .collect::<Result<Vec<u32>, _>>()?;
            Ok(values)
        })
        .await
    }

    async fn get_summary(&self, experiment_id: i64) -> Result<Option<PulseTrainSummary>, StorageError> {
        self.with_conn(move |conn| {
            let summary = conn
                .query_row(
                    "SELECT experiment_id, pattern, COALESCE(time_stamp, 0) \
                     FROM dadoscoletados_summary WHERE experiment_id = ?1 \
                     ORDER BY id DESC LIMIT 1",
                    params![experiment_id],
                    |row| {
                        Ok(PulseTrainSummary {
                            experiment_id: row.get(0)?,
                            pattern: row.get(1)?,
                            timestamp_ms: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(summary)
        })
        .await
    }

    async fn get_ground_truth(
        &self,
        experiment_name: &str,
    ) -> Result<Option<GroundTruthPattern>, StorageError> {
        let name = experiment_name.to_string();
        self.with_conn(move |conn| {
            let pattern = conn
                .query_row(
                    "SELECT experiment_name, ground_truth FROM ground_truth_patterns \
                     WHERE experiment_name = ?1",
                    params![name],
                    |row| {
                        Ok(GroundTruthPattern {
                            experiment_name: row.get(0)?,
                            ground_truth: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(pattern)
        })
        .await
    }

    async fn upsert_ground_truth(&self, pattern: &GroundTruthPattern) -> Result<(), StorageError> {
        let p = pattern.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO ground_truth_patterns (experiment_name, ground_truth) VALUES (?1, ?2) \
                 ON CONFLICT(experiment_name) DO UPDATE SET ground_truth = excluded.ground_truth",
                params![p.experiment_name, p.ground_truth],
            )?;
            Ok(())
        })
        .await
    }
}
