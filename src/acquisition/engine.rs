//! The acquisition loop.
//!
//! One [`AcquisitionLoop`] owns one transport handle and the detector/accumulator state
//! of the run it is executing. Several loops can run concurrently against a shared
//! storage gateway; nothing else is shared between them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::report::{RunOutcome, RunReport, StopReason};
use super::sink::{ExportPlan, SinkHandle, StoragePlan};
use super::state::AcquisitionState;
use crate::config::Settings;
use crate::decoder::BitWidth;
use crate::detector::ChangeDetector;
use crate::error::{DaqError, DaqResult};
use crate::export::{io_labels, VersionedExporter};
use crate::ground_truth::{compare, parse_pattern, PatternComparison};
use crate::pulse_train::PulseTrainAccumulator;
use crate::storage::{ExperimentConfig, FallbackBuffer, StorageError, StorageGateway};
use crate::transport::{ByteSource, TransportError};

/// Stop signal shared with whoever may end a run early.
///
/// Sending `true` stops every loop holding a receiver of this channel.
pub fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Polls one transport handle and turns state changes into stored, exported steps.
pub struct AcquisitionLoop<S: ByteSource> {
    source: S,
    gateway: Arc<dyn StorageGateway>,
    fallback: FallbackBuffer,
    settings: Settings,
    state: watch::Sender<AcquisitionState>,
}

impl<S: ByteSource> AcquisitionLoop<S> {
    /// Loop reading from `source`, persisting through `gateway`.
    pub fn new(source: S, gateway: Arc<dyn StorageGateway>, settings: Settings) -> Self {
        let fallback = FallbackBuffer::new(settings.storage.fallback_path.clone());
        Self::with_fallback(source, gateway, fallback, settings)
    }

    /// Same as [`AcquisitionLoop::new`] with an explicit fallback buffer.
    pub fn with_fallback(
        source: S,
        gateway: Arc<dyn StorageGateway>,
        fallback: FallbackBuffer,
        settings: Settings,
    ) -> Self {
        let (state, _) = watch::channel(AcquisitionState::Idle);
        Self {
            source,
            gateway,
            fallback,
            settings,
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<AcquisitionState> {
        self.state.subscribe()
    }

    /// Execute one run of `experiment` until timeout, stop signal or transport failure.
    ///
    /// Errors are returned only for problems found before polling starts (unknown
    /// experiment, invalid bit width, transport that cannot connect). Once polling has
    /// started the run always reaches `Stopped` and yields a [`RunReport`].
    pub async fn run(&mut self, experiment: &str, stop: watch::Receiver<bool>) -> DaqResult<RunReport> {
        if !self.state().can_begin() {
            return Err(DaqError::Configuration(format!(
                "cannot start a run while {}",
                self.state()
            )));
        }
        self.transition(AcquisitionState::Idle);

        let config = self.load_config(experiment).await?;
        let width = config
            .bit_width()
            .map_err(|e| DaqError::Configuration(format!("experiment '{}': {e}", config.name)))?;
        let experiment_id = self.next_experiment_id().await;

        let span = info_span!("acquisition", experiment = %config.name, experiment_id);
        self.run_configured(config, width, experiment_id, stop)
            .instrument(span)
            .await
    }

    async fn run_configured(
        &mut self,
        config: ExperimentConfig,
        width: BitWidth,
        experiment_id: i64,
        mut stop: watch::Receiver<bool>,
    ) -> DaqResult<RunReport> {
        let acq = self.settings.acquisition.clone();
        let read_timeout = acq.read_timeout();
        match tokio::time::timeout(read_timeout, self.source.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(TransportError::Timeout(acq.read_timeout_ms).into()),
        }
        info!(address = %config.address(), width = width.get(), "Transport connected");

        let mut detector = ChangeDetector::new(width);
        let mut accumulator = PulseTrainAccumulator::new(config.name.clone(), experiment_id, acq.origin());
        accumulator.reset(experiment_id);
        let mut sink = SinkHandle::spawn(
            self.storage_plan(),
            self.export_plan(&config, experiment_id),
            acq.sink_queue_capacity,
        );

        self.transition(AcquisitionState::Polling);
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + acq.run_timeout();
        let mut ticker = tokio::time::interval(acq.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reads: u64 = 0;
        let mut read_failures: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        let stop_reason = loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => break StopReason::StopSignal,
                _ = tokio::time::sleep_until(deadline) => break StopReason::Timeout,
                _ = ticker.tick() => {}
            }

            reads += 1;
            let read = match tokio::time::timeout(
                read_timeout,
                self.source.read_byte(config.db_number, acq.byte_offset),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(acq.read_timeout_ms)),
            };

            match read {
                Ok(byte) => {
                    consecutive_failures = 0;
                    if let Some(change) = detector.observe(byte) {
                        let record = accumulator.append(&change);
                        debug!(
                            step = record.step,
                            step_value = record.step_value,
                            pattern = %record.pattern,
                            time_to_change_s = record.time_to_change_s,
                            "Step detected"
                        );
                        sink.submit(record);
                    }
                }
                Err(err) => {
                    read_failures += 1;
                    consecutive_failures += 1;
                    warn!(
                        error = %err,
                        consecutive_failures,
                        threshold = acq.max_consecutive_read_failures,
                        "Byte read failed"
                    );
                    if consecutive_failures >= acq.max_consecutive_read_failures {
                        error!(consecutive_failures, "Too many failed reads, ending run early");
                        break StopReason::TransportFailures;
                    }
                }
            }
        };

        info!(reason = %stop_reason, steps = accumulator.len(), "Polling finished");
        self.transition(AcquisitionState::Exporting);

        if acq.record_final_dwell {
            if let Some(closing) = detector.dwell(Instant::now()) {
                let record = accumulator.append_closing(&closing);
                debug!(step = record.step, time_to_change_s = record.time_to_change_s, "Closing step recorded");
                sink.submit(record);
            }
        }

        let pattern = accumulator.snapshot_pattern();
        let stats = sink
            .finish(accumulator.records().to_vec(), accumulator.summary(), acq.finalize_timeout())
            .await;
        if !stats.storage_completed {
            warn!(buffered = stats.buffered, lost = stats.lost, "Storage did not finish the run in time");
        }

        match tokio::time::timeout(read_timeout, self.source.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "Transport disconnect failed"),
            Err(_) => warn!("Transport disconnect timed out"),
        }

        let comparison = self.compare_with_ground_truth(&config.name, &pattern).await;

        let mut report = RunReport {
            experiment: config.name.clone(),
            experiment_id,
            outcome: RunOutcome::Success,
            stop_reason,
            steps: accumulator.len(),
            reads,
            read_failures,
            stored: stats.stored,
            buffered: stats.buffered,
            lost: stats.lost,
            exports_written: stats.exports_written,
            export_failures: stats.export_failures,
            final_exports: stats.final_exports,
            final_export_error: stats.final_export_error,
            summary_stored: stats.summary_stored,
            summary_buffered: stats.summary_buffered,
            pattern,
            comparison,
            elapsed: started.elapsed(),
        };
        report.outcome = report.classify();

        self.transition(AcquisitionState::Stopped);
        info!(
            outcome = %report.outcome,
            steps = report.steps,
            stored = report.stored,
            buffered = report.buffered,
            "Run stopped"
        );
        Ok(report)
    }

    async fn load_config(&self, experiment: &str) -> DaqResult<ExperimentConfig> {
        let limit = self.settings.storage.call_timeout();
        match tokio::time::timeout(limit, self.gateway.get_config(experiment)).await {
            Ok(Ok(config)) => Ok(config),
            Ok(Err(StorageError::NotFound(name))) => Err(DaqError::Configuration(format!(
                "unknown experiment '{name}'"
            ))),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(StorageError::Timeout(self.settings.storage.call_timeout_ms).into()),
        }
    }

    async fn next_experiment_id(&self) -> i64 {
        let limit = self.settings.storage.call_timeout();
        match tokio::time::timeout(limit, self.gateway.next_experiment_id()).await {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => {
                warn!(error = %err, "Could not read previous experiment ids, starting at 1");
                1
            }
            Err(_) => {
                warn!("Reading previous experiment ids timed out, starting at 1");
                1
            }
        }
    }

    async fn compare_with_ground_truth(&self, experiment: &str, pattern: &[u32]) -> Option<PatternComparison> {
        let limit = self.settings.storage.call_timeout();
        let reference = match tokio::time::timeout(limit, self.gateway.get_ground_truth(experiment)).await {
            Ok(Ok(Some(reference))) => reference,
            Ok(Ok(None)) => return None,
            Ok(Err(err)) => {
                warn!(error = %err, "Could not load ground truth");
                return None;
            }
            Err(_) => {
                warn!("Loading ground truth timed out");
                return None;
            }
        };

        match parse_pattern(&reference.ground_truth) {
            Ok(values) => {
                let comparison = compare(pattern, &values);
                info!(%comparison, "Compared with ground truth");
                Some(comparison)
            }
            Err(err) => {
                warn!(error = %err, "Ground truth pattern is malformed");
                None
            }
        }
    }

    fn storage_plan(&self) -> StoragePlan {
        StoragePlan {
            gateway: Arc::clone(&self.gateway),
            fallback: self.fallback.clone(),
            call_timeout: self.settings.storage.call_timeout(),
            retry: self.settings.storage.retry.clone(),
        }
    }

    fn export_plan(&self, config: &ExperimentConfig, experiment_id: i64) -> ExportPlan {
        let export = &self.settings.export;
        let layout = export.layout();
        ExportPlan {
            exporter: VersionedExporter::new(layout.target_dir()),
            base_name: layout.base_name(&config.name, experiment_id),
            formats: export.formats.clone(),
            io_labels: io_labels(config.num_inputs, config.num_outputs),
            every: export.incremental_every,
            write_timeout: export.write_timeout(),
            retry: export.retry.clone(),
        }
    }

    fn transition(&self, next: AcquisitionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "Unexpected state transition");
        }
        info!(from = %current, to = %next, "State transition");
        self.state.send_replace(next);
    }
}

/// Resolves once the stop flag is `true`; never resolves if every sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Bounded wait used by tests and callers that poll a loop's state.
pub async fn wait_for_state(
    state: &mut watch::Receiver<AcquisitionState>,
    target: AcquisitionState,
    limit: Duration,
) -> bool {
    tokio::time::timeout(limit, state.wait_for(|s| *s == target))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}
