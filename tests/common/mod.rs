//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pulse_train_daq::config::Settings;
use pulse_train_daq::export::ExportFormat;
use pulse_train_daq::pulse_train::{PulseTrainSummary, StepRecord};
use pulse_train_daq::retry::RetryPolicy;
use pulse_train_daq::storage::{
    ExperimentConfig, GroundTruthPattern, SqliteGateway, StorageError, StorageGateway,
};

/// Fast settings writing everything below `dir`.
pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.acquisition.poll_interval_ms = 2;
    settings.acquisition.run_timeout_secs = 1;
    settings.acquisition.read_timeout_ms = 50;
    settings.acquisition.finalize_timeout_secs = 5;
    settings.storage.fallback_path = dir.join("fallback.jsonl");
    settings.storage.call_timeout_ms = 500;
    settings.storage.retry = RetryPolicy::immediate(3);
    settings.export.output_dir = dir.join("exports");
    settings.export.dated_subdir = false;
    settings.export.formats = vec![ExportFormat::Txt, ExportFormat::Csv];
    // final exports only; snapshot tests opt in
    settings.export.incremental_every = 0;
    settings.export.retry = RetryPolicy::immediate(2);
    settings
}

pub fn experiment(name: &str, inputs: u8, outputs: u8) -> ExperimentConfig {
    ExperimentConfig {
        name: name.to_string(),
        host: "192.168.0.10".to_string(),
        rack: 0,
        slot: 1,
        db_number: 12,
        num_inputs: inputs,
        num_outputs: outputs,
    }
}

/// In-memory SQLite gateway with the given experiments registered.
pub async fn sqlite_with(configs: &[ExperimentConfig]) -> Arc<SqliteGateway> {
    let db = SqliteGateway::in_memory().unwrap();
    for config in configs {
        db.upsert_config(config).await.unwrap();
    }
    Arc::new(db)
}

/// Gateway whose first `failing_steps` step inserts fail with `Unavailable`.
pub struct FlakyGateway {
    inner: Arc<SqliteGateway>,
    failing_steps: usize,
    step_calls: AtomicUsize,
    fail_summaries: bool,
}

impl FlakyGateway {
    pub fn new(inner: Arc<SqliteGateway>, failing_steps: usize) -> Self {
        Self {
            inner,
            failing_steps,
            step_calls: AtomicUsize::new(0),
            fail_summaries: false,
        }
    }

    pub fn failing_summaries(mut self) -> Self {
        self.fail_summaries = true;
        self
    }

    pub fn step_calls(&self) -> usize {
        self.step_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageGateway for FlakyGateway {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn get_config(&self, experiment_name: &str) -> Result<ExperimentConfig, StorageError> {
        self.inner.get_config(experiment_name).await
    }

    async fn list_experiments(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_experiments().await
    }

    async fn upsert_config(&self, config: &ExperimentConfig) -> Result<(), StorageError> {
        self.inner.upsert_config(config).await
    }

    async fn next_experiment_id(&self) -> Result<i64, StorageError> {
        self.inner.next_experiment_id().await
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<(), StorageError> {
        let call = self.step_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failing_steps {
            return Err(StorageError::Unavailable("connection refused".into()));
        }
        self.inner.insert_step(record).await
    }

    async fn insert_summary(&self, summary: &PulseTrainSummary) -> Result<(), StorageError> {
        if self.fail_summaries {
            return Err(StorageError::Unavailable("connection refused".into()));
        }
        self.inner.insert_summary(summary).await
    }

    async fn get_pulse_values(&self, experiment_id: i64) -> Result<Vec<u32>, StorageError> {
        self.inner.get_pulse_values(experiment_id).await
    }

    async fn get_summary(&self, experiment_id: i64) -> Result<Option<PulseTrainSummary>, StorageError> {
        self.inner.get_summary(experiment_id).await
    }

    async fn get_ground_truth(
        &self,
        experiment_name: &str,
    ) -> Result<Option<GroundTruthPattern>, StorageError> {
        self.inner.get_ground_truth(experiment_name).await
    }

    async fn upsert_ground_truth(&self, pattern: &GroundTruthPattern) -> Result<(), StorageError> {
        self.inner.upsert_ground_truth(pattern).await
    }
}

/// Gateway whose inserts stall: each step takes `step_delay`, or with no delay steps
/// and summaries never return at all.
pub struct StallingGateway {
    inner: Arc<SqliteGateway>,
    step_delay: Option<Duration>,
}

impl StallingGateway {
    pub fn hanging(inner: Arc<SqliteGateway>) -> Self {
        Self {
            inner,
            step_delay: None,
        }
    }

    pub fn slow_steps(inner: Arc<SqliteGateway>, delay: Duration) -> Self {
        Self {
            inner,
            step_delay: Some(delay),
        }
    }

    async fn stall(&self) {
        match self.step_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl StorageGateway for StallingGateway {
    fn backend_name(&self) -> &'static str {
        "stalling"
    }

    async fn get_config(&self, experiment_name: &str) -> Result<ExperimentConfig, StorageError> {
        self.inner.get_config(experiment_name).await
    }

    async fn list_experiments(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_experiments().await
    }

    async fn upsert_config(&self, config: &ExperimentConfig) -> Result<(), StorageError> {
        self.inner.upsert_config(config).await
    }

    async fn next_experiment_id(&self) -> Result<i64, StorageError> {
        self.inner.next_experiment_id().await
    }

    async fn insert_step(&self, record: &StepRecord) -> Result<(), StorageError> {
        self.stall().await;
        self.inner.insert_step(record).await
    }

    async fn insert_summary(&self, summary: &PulseTrainSummary) -> Result<(), StorageError> {
        if self.step_delay.is_none() {
            self.stall().await;
        }
        self.inner.insert_summary(summary).await
    }

    async fn get_pulse_values(&self, experiment_id: i64) -> Result<Vec<u32>, StorageError> {
        self.inner.get_pulse_values(experiment_id).await
    }

    async fn get_summary(&self, experiment_id: i64) -> Result<Option<PulseTrainSummary>, StorageError> {
        self.inner.get_summary(experiment_id).await
    }

    async fn get_ground_truth(
        &self,
        experiment_name: &str,
    ) -> Result<Option<GroundTruthPattern>, StorageError> {
        self.inner.get_ground_truth(experiment_name).await
    }

    async fn upsert_ground_truth(&self, pattern: &GroundTruthPattern) -> Result<(), StorageError> {
        self.inner.upsert_ground_truth(pattern).await
    }
}

/// `count` bytes alternating between 0 and 1.
pub fn alternating(count: usize) -> Vec<u8> {
    (0..count).map(|i| (i % 2) as u8).collect()
}

/// Step column of an exported `.csv` file.
pub fn csv_steps(path: &Path) -> Vec<u64> {
    let text = std::fs::read_to_string(path).unwrap();
    text.lines()
        .skip(1)
        .map(|line| line.split(',').next().unwrap().parse().unwrap())
        .collect()
}
