//! # Stuck Batch Compensation
//!
//! Event delivery is at-least-once at best, so liveness needs an out-of-band check. A
//! periodic sweep asks the repository for batches parked too long in a waiting state and
//! compensates each one:
//!
//! - **scattering** with every file accounted for: the `GatheringCompleted` that should have
//!   followed is re-synthesized (with no chart references) and either dispatched locally or
//!   published to the bus
//! - **diagnosing** past the timeout: forced to `failed` with a timeout message
//!
//! A failure on one batch never stops the sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::OrchestrationEngine;
use crate::barrier;
use crate::config::CompensationConfig;
use crate::domain::{Batch, BatchStatus, DomainEvent};
use crate::error::ArgusResult;
use crate::logging::log_error;
use crate::repository::BatchRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationAction {
    /// A `GatheringCompleted` was re-synthesized for a fully parsed batch
    GatheringRedelivered,
    /// A diagnosis overran its timeout and the batch was failed
    DiagnosisTimedOut,
    /// Nothing to do; the batch is still legitimately waiting or already moved on
    NoAction,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub gathering_redelivered: usize,
    pub diagnosis_timed_out: usize,
    pub untouched: usize,
    pub failures: Vec<(Uuid, String)>,
}

impl SweepReport {
    fn record(&mut self, action: CompensationAction) {
        match action {
            CompensationAction::GatheringRedelivered => self.gathering_redelivered += 1,
            CompensationAction::DiagnosisTimedOut => self.diagnosis_timed_out += 1,
            CompensationAction::NoAction => self.untouched += 1,
        }
    }
}

#[derive(Clone)]
pub struct Compensator {
    engine: OrchestrationEngine,
    batches: Arc<dyn BatchRepository>,
    config: CompensationConfig,
}

impl std::fmt::Debug for Compensator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compensator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Compensator {
    pub fn new(
        engine: OrchestrationEngine,
        batches: Arc<dyn BatchRepository>,
        config: CompensationConfig,
    ) -> Self {
        Self {
            engine,
            batches,
            config,
        }
    }

    /// Compensate one batch reported as stuck.
    pub async fn handle_stuck_batch(&self, batch: &Batch) -> ArgusResult<CompensationAction> {
        match batch.status {
            BatchStatus::Scattering => self.compensate_scattering(batch).await,
            BatchStatus::Diagnosing => self.compensate_diagnosing(batch.id).await,
            _ => Ok(CompensationAction::NoAction),
        }
    }

    async fn compensate_scattering(&self, batch: &Batch) -> ArgusResult<CompensationAction> {
        let barrier_count = self.engine.barrier().count(batch.id).await?;
        let processed = barrier_count.max(u64::from(batch.processed_files));

        if !barrier::is_complete(processed, batch.total_files) {
            debug!(
                batch_id = %batch.id,
                processed = processed,
                total = batch.total_files,
                "Scattering batch still waiting on files"
            );
            return Ok(CompensationAction::NoAction);
        }

        warn!(
            batch_id = %batch.id,
            total = batch.total_files,
            via_bus = self.config.redeliver_via_bus,
            "🩹 Re-synthesizing lost GatheringCompleted"
        );

        let event = DomainEvent::gathering_completed(batch.id, batch.total_files, Vec::new());
        if self.config.redeliver_via_bus {
            self.engine.publisher().publish_events(&[event]).await?;
        } else {
            self.engine.handle_event(&event).await?;
        }
        Ok(CompensationAction::GatheringRedelivered)
    }

    async fn compensate_diagnosing(&self, batch_id: Uuid) -> ArgusResult<CompensationAction> {
        // The sweep's copy may be stale; decide on the current row
        let mut batch = self.engine.load_batch(batch_id).await?;
        let timeout = self.config.diagnosing_timeout();
        let deadline = crate::repository::cutoff(Utc::now(), timeout);

        if batch.status != BatchStatus::Diagnosing || batch.updated_at >= deadline {
            return Ok(CompensationAction::NoAction);
        }

        let minutes = timeout.as_secs() / 60;
        batch.fail(format!("Diagnosis timeout after {minutes} minutes"))?;
        self.engine.persist_and_publish(&mut batch).await?;

        warn!(
            batch_id = %batch.id,
            timeout_minutes = minutes,
            "⏰ Diagnosis timed out, batch failed"
        );
        Ok(CompensationAction::DiagnosisTimedOut)
    }

    /// Find stuck batches and compensate each of them.
    pub async fn run_sweep(&self) -> ArgusResult<SweepReport> {
        let stuck = self
            .batches
            .find_stuck_batches(
                Utc::now(),
                self.config.scattering_threshold(),
                self.config.diagnosing_timeout(),
            )
            .await?;

        let mut report = SweepReport {
            examined: stuck.len(),
            ..SweepReport::default()
        };

        for batch in &stuck {
            match self.handle_stuck_batch(batch).await {
                Ok(action) => report.record(action),
                Err(e) => {
                    log_error(
                        "compensation",
                        "handle_stuck_batch",
                        &e.to_string(),
                        Some(&batch.id.to_string()),
                    );
                    report.failures.push((batch.id, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Sweep on the configured interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_seconds = self.config.sweep_interval_seconds,
            scattering_stuck_after_seconds = self.config.scattering_stuck_after_seconds,
            diagnosing_timeout_seconds = self.config.diagnosing_timeout_seconds,
            "🚀 Starting compensation sweep"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_sweep().await {
                Ok(report) if report.examined > 0 => {
                    info!(
                        examined = report.examined,
                        gathering_redelivered = report.gathering_redelivered,
                        diagnosis_timed_out = report.diagnosis_timed_out,
                        failures = report.failures.len(),
                        "Compensation sweep completed"
                    );
                }
                Ok(_) => debug!("No stuck batches this cycle"),
                Err(e) => error!(error = %e, "Compensation sweep failed"),
            }
        }

        info!("🛑 Compensation sweep stopped");
    }
}
