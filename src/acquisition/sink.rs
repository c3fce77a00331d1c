//! Per-run record pipeline: storage inserts and snapshot exports off the polling path.
//!
//! Two tasks run per acquisition run. The storage task inserts steps in step-index
//! order and finally the summary row. The export task writes incremental snapshots and
//! finally the end-of-run export. The loop appends every record to a shared journal and
//! hands journal positions over through bounded channels, so it never waits on storage
//! or the filesystem, and exports never wait behind a storage backlog.
//!
//! Every step ends up settled exactly once in the counters: stored, buffered, or lost.
//! When the storage queue is full a step goes to the fallback buffer on the blocking
//! pool. When storage has not caught up by the end-of-run deadline, every step it has
//! not settled yet and the summary are buffered before the report is built.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::export::{ExportError, ExportFormat, VersionedExporter};
use crate::pulse_train::{PulseTrainSummary, StepRecord};
use crate::retry::RetryPolicy;
use crate::storage::{FallbackBuffer, FallbackEntry, StorageError, StorageGateway};

/// What gets exported and how.
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Writer for the run's target directory.
    pub exporter: VersionedExporter,
    /// File base name, e.g. `press_4`.
    pub base_name: String,
    /// One file per format for every snapshot.
    pub formats: Vec<ExportFormat>,
    /// Labels for the `.txt` header.
    pub io_labels: Vec<String>,
    /// Snapshot every N steps (0 disables incremental snapshots).
    pub every: u64,
    /// Deadline for a single export attempt.
    pub write_timeout: Duration,
    /// Retry budget of the final export.
    pub retry: RetryPolicy,
}

/// Storage side of the sink.
#[derive(Clone)]
pub struct StoragePlan {
    /// Gateway shared with the other streams.
    pub gateway: Arc<dyn StorageGateway>,
    /// Where records go when the gateway cannot take them.
    pub fallback: FallbackBuffer,
    /// Deadline for a single gateway call.
    pub call_timeout: Duration,
    /// Retry budget for inserts.
    pub retry: RetryPolicy,
}

/// Counters updated by the sink tasks as they go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Steps acknowledged by storage.
    pub stored: usize,
    /// Steps parked in the fallback buffer.
    pub buffered: usize,
    /// Steps neither stored nor confirmed in the fallback buffer.
    pub lost: usize,
    /// Snapshot files written.
    pub exports_written: usize,
    /// Snapshots that failed.
    pub export_failures: usize,
    /// Files of the final export.
    pub final_exports: Vec<PathBuf>,
    /// Why the final export is missing.
    pub final_export_error: Option<String>,
    /// Summary acknowledged by storage.
    pub summary_stored: bool,
    /// Summary parked in the fallback buffer.
    pub summary_buffered: bool,
    /// The storage task got through every step and the summary before the deadline.
    pub storage_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Sent to the storage task, not settled yet.
    Queued,
    /// Handed to a blocking fallback push.
    Overflow,
    Settled,
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Stored,
    Buffered,
    Lost,
}

/// Records of the run and what became of each of them.
#[derive(Default)]
struct Ledger {
    journal: Vec<StepRecord>,
    slots: Vec<Slot>,
    summary_settled: bool,
    stats: SinkStats,
}

impl Ledger {
    fn settle(&mut self, position: usize, outcome: Settlement) {
        let Some(slot) = self.slots.get_mut(position) else {
            return;
        };
        if *slot == Slot::Settled {
            return;
        }
        *slot = Slot::Settled;
        match outcome {
            Settlement::Stored => self.stats.stored += 1,
            Settlement::Buffered => self.stats.buffered += 1,
            Settlement::Lost => self.stats.lost += 1,
        }
    }

    fn positions(&self, state: Slot) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| **slot == state)
            .map(|(position, _)| position)
            .collect()
    }
}

fn with_ledger<T>(ledger: &Mutex<Ledger>, f: impl FnOnce(&mut Ledger) -> T) -> T {
    match ledger.lock() {
        Ok(mut guard) => f(&mut guard),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

enum StorageMessage {
    Step(usize),
    Summary(PulseTrainSummary),
}

enum ExportMessage {
    Snapshot(usize),
    Final(Vec<StepRecord>),
}

/// Push entries to the fallback buffer from the blocking pool.
async fn park(fallback: &FallbackBuffer, entries: Vec<FallbackEntry>) -> Result<(), StorageError> {
    let fallback = fallback.clone();
    tokio::task::spawn_blocking(move || fallback.push_all(&entries)).await?
}

/// Sending half held by the acquisition loop.
pub struct SinkHandle {
    storage_tx: mpsc::Sender<StorageMessage>,
    export_tx: mpsc::Sender<ExportMessage>,
    fallback: FallbackBuffer,
    every: u64,
    ledger: Arc<Mutex<Ledger>>,
    overflow: JoinSet<()>,
    storage_task: JoinHandle<()>,
    export_task: JoinHandle<()>,
}

impl SinkHandle {
    /// Start the storage and export tasks for one run.
    pub fn spawn(storage: StoragePlan, export: ExportPlan, capacity: usize) -> Self {
        let (storage_tx, storage_rx) = mpsc::channel(capacity.max(1));
        let (export_tx, export_rx) = mpsc::channel(capacity.max(1));
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let fallback = storage.fallback.clone();
        let every = export.every;

        let storage_task = tokio::spawn(
            StorageWorker {
                plan: storage,
                ledger: Arc::clone(&ledger),
            }
            .run(storage_rx),
        );
        let export_task = tokio::spawn(
            ExportWorker {
                plan: export,
                ledger: Arc::clone(&ledger),
            }
            .run(export_rx),
        );

        Self {
            storage_tx,
            export_tx,
            fallback,
            every,
            ledger,
            overflow: JoinSet::new(),
            storage_task,
            export_task,
        }
    }

    /// Queue a step without waiting.
    ///
    /// When the storage queue is full the record goes to the fallback buffer on the
    /// blocking pool. A snapshot that does not fit in the export queue is skipped; the
    /// next one covers it.
    pub fn submit(&mut self, record: StepRecord) {
        let step = record.step;
        let position = with_ledger(&self.ledger, |l| {
            l.journal.push(record.clone());
            l.slots.push(Slot::Queued);
            l.journal.len() - 1
        });

        if self.storage_tx.try_send(StorageMessage::Step(position)).is_err() {
            warn!(step, "Storage queue full, buffering step locally");
            with_ledger(&self.ledger, |l| l.slots[position] = Slot::Overflow);
            let fallback = self.fallback.clone();
            let ledger = Arc::clone(&self.ledger);
            self.overflow.spawn_blocking(move || {
                let outcome = match fallback.push(&FallbackEntry::Step(record)) {
                    Ok(()) => Settlement::Buffered,
                    Err(err) => {
                        error!(step, error = %err, "Fallback buffer rejected step");
                        Settlement::Lost
                    }
                };
                with_ledger(&ledger, |l| l.settle(position, outcome));
            });
        }

        if self.every > 0
            && (position as u64 + 1) % self.every == 0
            && self.export_tx.try_send(ExportMessage::Snapshot(position)).is_err()
        {
            debug!(step, "Export queue full, snapshot skipped");
        }
    }

    /// Hand over the final records and summary, then wait up to `limit` for both tasks.
    ///
    /// The final export runs on the export task and does not wait for storage. Steps
    /// and the summary that storage has not settled by the deadline are buffered.
    pub async fn finish(
        self,
        records: Vec<StepRecord>,
        summary: PulseTrainSummary,
        limit: Duration,
    ) -> SinkStats {
        let SinkHandle {
            storage_tx,
            export_tx,
            fallback,
            ledger,
            mut overflow,
            mut storage_task,
            mut export_task,
            ..
        } = self;
        let deadline = tokio::time::Instant::now() + limit;

        let final_queued = tokio::time::timeout_at(deadline, export_tx.send(ExportMessage::Final(records)))
            .await
            .map(|sent| sent.is_ok())
            .unwrap_or(false);
        drop(export_tx);
        let summary_queued = tokio::time::timeout_at(
            deadline,
            storage_tx.send(StorageMessage::Summary(summary.clone())),
        )
        .await
        .map(|sent| sent.is_ok())
        .unwrap_or(false);
        drop(storage_tx);
        if !summary_queued {
            warn!("Storage task did not accept the summary");
        }

        let (export_done, storage_done) = tokio::join!(
            join_until(deadline, &mut export_task, "export"),
            join_until(deadline, &mut storage_task, "storage"),
        );

        loop {
            match tokio::time::timeout_at(deadline, overflow.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = overflow.len(), "Fallback pushes still running at the deadline");
                    break;
                }
            }
        }

        let (queued, unconfirmed, summary_pending) = with_ledger(&ledger, |l| {
            let unconfirmed = l.positions(Slot::Overflow);
            for &position in &unconfirmed {
                l.settle(position, Settlement::Lost);
            }
            let queued: Vec<(usize, StepRecord)> = l
                .positions(Slot::Queued)
                .into_iter()
                .map(|position| (position, l.journal[position].clone()))
                .collect();
            (queued, unconfirmed.len(), !l.summary_settled)
        });
        if unconfirmed > 0 {
            error!(steps = unconfirmed, "Fallback pushes not confirmed, counting steps as lost");
        }

        if !queued.is_empty() || summary_pending {
            warn!(
                steps = queued.len(),
                summary = summary_pending,
                "Storage did not finish in time, buffering the rest locally"
            );
            let mut entries: Vec<FallbackEntry> =
                queued.iter().map(|(_, record)| FallbackEntry::Step(record.clone())).collect();
            if summary_pending {
                entries.push(FallbackEntry::Summary(summary));
            }
            let outcome = match tokio::time::timeout(limit, park(&fallback, entries)).await {
                Ok(Ok(())) => Settlement::Buffered,
                Ok(Err(err)) => {
                    error!(error = %err, "Fallback buffer rejected the end-of-run records");
                    Settlement::Lost
                }
                Err(_) => {
                    error!("Fallback buffer did not respond in time");
                    Settlement::Lost
                }
            };
            with_ledger(&ledger, |l| {
                for (position, _) in &queued {
                    l.settle(*position, outcome);
                }
                if summary_pending {
                    l.summary_settled = true;
                    l.stats.summary_buffered = matches!(outcome, Settlement::Buffered);
                }
            });
        }

        with_ledger(&ledger, |l| {
            if l.stats.final_exports.is_empty() && l.stats.final_export_error.is_none() {
                l.stats.final_export_error = Some(if !final_queued {
                    "final export could not be queued".to_string()
                } else if !export_done {
                    "final export did not finish in time".to_string()
                } else {
                    "final export was not written".to_string()
                });
            }
            l.stats.storage_completed = storage_done && l.stats.storage_completed;
            l.stats.clone()
        })
    }
}

/// Wait for `task` until `deadline`; abort it if it is still running. True when it completed.
async fn join_until(deadline: tokio::time::Instant, task: &mut JoinHandle<()>, name: &str) -> bool {
    match tokio::time::timeout_at(deadline, &mut *task).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            error!(task = name, error = %err, "Record sink task failed");
            false
        }
        Err(_) => {
            error!(task = name, "Record sink task did not finish in time");
            task.abort();
            // the task only parks at await points, so this returns promptly
            let _ = task.await;
            false
        }
    }
}

struct StorageWorker {
    plan: StoragePlan,
    ledger: Arc<Mutex<Ledger>>,
}

impl StorageWorker {
    async fn run(self, mut rx: mpsc::Receiver<StorageMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                StorageMessage::Step(position) => {
                    let Some(record) = with_ledger(&self.ledger, |l| l.journal.get(position).cloned()) else {
                        continue;
                    };
                    let outcome = self.store_step(&record).await;
                    with_ledger(&self.ledger, |l| l.settle(position, outcome));
                }
                StorageMessage::Summary(summary) => {
                    self.store_summary(summary).await;
                    with_ledger(&self.ledger, |l| l.stats.storage_completed = true);
                    break;
                }
            }
        }
    }

    async fn store_step(&self, record: &StepRecord) -> Settlement {
        let gateway = &self.plan.gateway;
        let result = self
            .plan
            .retry
            .run("insert_step", Some(self.plan.call_timeout), move || {
                gateway.insert_step(record)
            })
            .await;

        match result {
            Ok(()) => {
                debug!(step = record.step, "Step stored");
                Settlement::Stored
            }
            Err(exhausted) => {
                error!(step = record.step, error = %exhausted, "Step insert failed, buffering locally");
                match park(&self.plan.fallback, vec![FallbackEntry::Step(record.clone())]).await {
                    Ok(()) => Settlement::Buffered,
                    Err(err) => {
                        error!(step = record.step, error = %err, "Fallback buffer rejected step");
                        Settlement::Lost
                    }
                }
            }
        }
    }

    async fn store_summary(&self, summary: PulseTrainSummary) {
        let gateway = &self.plan.gateway;
        let summary_ref = &summary;
        let result = self
            .plan
            .retry
            .run("insert_summary", Some(self.plan.call_timeout), move || {
                gateway.insert_summary(summary_ref)
            })
            .await;

        let (stored, buffered) = match result {
            Ok(()) => {
                info!(pattern = %summary.pattern, "Run summary stored");
                (true, false)
            }
            Err(exhausted) => {
                error!(error = %exhausted, "Summary insert failed, buffering locally");
                match park(&self.plan.fallback, vec![FallbackEntry::Summary(summary.clone())]).await {
                    Ok(()) => (false, true),
                    Err(err) => {
                        error!(error = %err, "Fallback buffer rejected summary");
                        (false, false)
                    }
                }
            }
        };
        with_ledger(&self.ledger, |l| {
            l.summary_settled = true;
            l.stats.summary_stored = stored;
            l.stats.summary_buffered = buffered;
        });
    }
}

struct ExportWorker {
    plan: ExportPlan,
    ledger: Arc<Mutex<Ledger>>,
}

impl ExportWorker {
    async fn run(self, mut rx: mpsc::Receiver<ExportMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                ExportMessage::Snapshot(position) => self.snapshot(position).await,
                ExportMessage::Final(records) => {
                    self.final_export(&records).await;
                    break;
                }
            }
        }
    }

    /// Export the journal up to and including `position`.
    async fn snapshot(&self, position: usize) {
        let records = with_ledger(&self.ledger, |l| {
            l.journal.get(..=position).map(<[StepRecord]>::to_vec).unwrap_or_default()
        });
        // A failed snapshot is picked up by the next one.
        match self.export_all(&records, &RetryPolicy::immediate(1)).await {
            Ok(paths) => with_ledger(&self.ledger, |l| l.stats.exports_written += paths.len()),
            Err(err) => {
                warn!(error = %err, steps = records.len(), "Incremental export failed");
                with_ledger(&self.ledger, |l| l.stats.export_failures += 1);
            }
        }
    }

    async fn final_export(&self, records: &[StepRecord]) {
        match self.export_all(records, &self.plan.retry).await {
            Ok(paths) => {
                for path in &paths {
                    info!(path = %path.display(), "Final export written");
                }
                with_ledger(&self.ledger, |l| l.stats.final_exports = paths);
            }
            Err(err) => {
                error!(error = %err, "Final export failed after retries");
                with_ledger(&self.ledger, |l| l.stats.final_export_error = Some(err));
            }
        }
    }

    /// Write one file per format; stops at the first format that exhausts `retry`.
    async fn export_all(&self, records: &[StepRecord], retry: &RetryPolicy) -> Result<Vec<PathBuf>, String> {
        let mut written = Vec::with_capacity(self.plan.formats.len());
        for &format in &self.plan.formats {
            let content = format
                .render(&self.plan.io_labels, records)
                .map_err(|e| e.to_string())?;
            let content = Arc::new(content);
            let exporter = &self.plan.exporter;
            let base_name = &self.plan.base_name;
            let write_timeout = self.plan.write_timeout;

            let path = retry
                .run("export", Some(write_timeout), || {
                    let exporter = exporter.clone();
                    let base_name = base_name.clone();
                    let content = Arc::clone(&content);
                    // taken before the attempt's timer starts
                    let deadline = Instant::now() + write_timeout;
                    async move {
                        match tokio::task::spawn_blocking(move || {
                            exporter.export_before(&base_name, format, &content, deadline)
                        })
                        .await
                        {
                            Ok(result) => result,
                            Err(e) => Err(ExportError::Render(format!("export worker failed: {e}"))),
                        }
                    }
                })
                .await
                .map_err(|e| e.to_string())?;
            written.push(path);
        }
        Ok(written)
    }
}
