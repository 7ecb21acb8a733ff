//! Compensation sweep against batches whose triggering event was lost.

mod common;

use std::time::Duration;

use argus_core::config::CompensationConfig;
use argus_core::domain::{BatchStatus, DomainEvent};
use argus_core::orchestration::CompensationAction;
use argus_core::repository::BatchRepository;
use common::{TestOrchestrator, TOPIC};
use tokio_util::sync::CancellationToken;

fn config() -> CompensationConfig {
    CompensationConfig {
        enabled: true,
        sweep_interval_seconds: 1,
        scattering_stuck_after_seconds: 5 * 60,
        diagnosing_timeout_seconds: 10 * 60,
        redeliver_via_bus: false,
    }
}

/// Drive a batch to `scattering` with every file recorded in the barrier, as if the
/// final `FileParsed` transition had been lost.
async fn stuck_scattering_batch(orchestrator: &TestOrchestrator) -> uuid::Uuid {
    let (batch, file_ids) = orchestrator.scattering_batch(2).await;
    for file_id in &file_ids {
        orchestrator
            .engine
            .barrier()
            .record(batch.id, *file_id)
            .await
            .unwrap();
    }
    orchestrator
        .age_batch(batch.id, Duration::from_secs(6 * 60))
        .await;
    batch.id
}

async fn diagnosing_batch(orchestrator: &TestOrchestrator) -> uuid::Uuid {
    let (batch, file_ids) = orchestrator.scattering_batch(1).await;
    orchestrator
        .engine
        .handle_event(&DomainEvent::file_parsed(batch.id, file_ids[0]))
        .await
        .unwrap();
    orchestrator
        .engine
        .handle_event(&DomainEvent::gathering_completed(batch.id, 1, vec![]))
        .await
        .unwrap();
    assert_eq!(orchestrator.status(batch.id), BatchStatus::Diagnosing);
    batch.id
}

#[tokio::test]
async fn test_stuck_scattering_batch_is_advanced_in_process() {
    let orchestrator = TestOrchestrator::new();
    let batch_id = stuck_scattering_batch(&orchestrator).await;

    let report = orchestrator.compensator(config()).run_sweep().await.unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.gathering_redelivered, 1);
    assert!(report.failures.is_empty());

    let batch = orchestrator.batch(batch_id);
    assert_eq!(batch.status, BatchStatus::Diagnosing);
    assert_eq!(batch.processed_files, 2);
}

#[tokio::test]
async fn test_stuck_scattering_batch_can_be_redelivered_via_bus() {
    let orchestrator = TestOrchestrator::new();
    let batch_id = stuck_scattering_batch(&orchestrator).await;

    let compensator = orchestrator.compensator(CompensationConfig {
        redeliver_via_bus: true,
        ..config()
    });
    let report = compensator.run_sweep().await.unwrap();
    assert_eq!(report.gathering_redelivered, 1);

    // Nothing changes locally; the synthesized event is on the bus for any consumer
    assert_eq!(orchestrator.status(batch_id), BatchStatus::Scattering);
    let synthesized = orchestrator
        .memory_bus()
        .published_events(TOPIC)
        .await
        .into_iter()
        .find_map(|event| match event {
            DomainEvent::GatheringCompleted(e) if e.batch_id == batch_id => Some(e),
            _ => None,
        })
        .expect("GatheringCompleted published");
    assert_eq!(synthesized.total_files, 2);
    assert!(synthesized.chart_refs.is_empty());

    orchestrator
        .engine
        .handle_event(&DomainEvent::GatheringCompleted(synthesized))
        .await
        .unwrap();
    assert_eq!(orchestrator.status(batch_id), BatchStatus::Diagnosing);
}

#[tokio::test]
async fn test_scattering_batch_still_missing_files_is_left_alone() {
    let orchestrator = TestOrchestrator::new();
    let (batch, file_ids) = orchestrator.scattering_batch(3).await;
    orchestrator
        .engine
        .barrier()
        .record(batch.id, file_ids[0])
        .await
        .unwrap();
    orchestrator
        .age_batch(batch.id, Duration::from_secs(6 * 60))
        .await;

    let report = orchestrator.compensator(config()).run_sweep().await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.untouched, 1);
    assert_eq!(orchestrator.status(batch.id), BatchStatus::Scattering);
}

#[tokio::test]
async fn test_diagnosis_timeout_fails_batch() {
    let orchestrator = TestOrchestrator::new();
    let batch_id = diagnosing_batch(&orchestrator).await;
    orchestrator
        .age_batch(batch_id, Duration::from_secs(11 * 60))
        .await;

    let report = orchestrator.compensator(config()).run_sweep().await.unwrap();
    assert_eq!(report.diagnosis_timed_out, 1);

    let failed = orchestrator.batch(batch_id);
    assert_eq!(failed.status, BatchStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("Diagnosis timeout after 10 minutes")
    );
    assert!(orchestrator
        .published_transitions(batch_id)
        .await
        .contains(&(BatchStatus::Diagnosing, BatchStatus::Failed)));

    // A late diagnosis cannot resurrect the batch
    let late = common::diagnosis_completed_payload(batch_id);
    assert!(orchestrator.engine.handle_message(&late).await.is_err());
    assert_eq!(orchestrator.status(batch_id), BatchStatus::Failed);
}

#[tokio::test]
async fn test_recent_batches_are_not_swept() {
    let orchestrator = TestOrchestrator::new();
    let diagnosing = diagnosing_batch(&orchestrator).await;
    let (scattering, _) = orchestrator.scattering_batch(1).await;

    let report = orchestrator.compensator(config()).run_sweep().await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(orchestrator.status(diagnosing), BatchStatus::Diagnosing);
    assert_eq!(orchestrator.status(scattering.id), BatchStatus::Scattering);
}

#[tokio::test]
async fn test_stale_snapshot_of_completed_batch_is_ignored() {
    let orchestrator = TestOrchestrator::new();
    let batch_id = diagnosing_batch(&orchestrator).await;
    let stale = orchestrator.batch(batch_id);

    orchestrator
        .engine
        .handle_message(&common::diagnosis_completed_payload(batch_id))
        .await
        .unwrap();

    let action = orchestrator
        .compensator(config())
        .handle_stuck_batch(&stale)
        .await
        .unwrap();
    assert_eq!(action, CompensationAction::NoAction);
    assert_eq!(orchestrator.status(batch_id), BatchStatus::Completed);
}

#[tokio::test]
async fn test_one_failing_batch_does_not_stop_the_sweep() {
    let orchestrator = TestOrchestrator::new();
    let healthy = stuck_scattering_batch(&orchestrator).await;
    let broken = diagnosing_batch(&orchestrator).await;

    // Strand an event the bus will never accept in the broken batch's outbox
    let oversized = DomainEvent::gathering_completed(
        broken,
        1,
        vec!["x".repeat(2 * 1024 * 1024)],
    );
    let stranded = orchestrator.batch(broken).with_pending_events(vec![oversized]);
    orchestrator.batches.save(&stranded).await.unwrap();
    orchestrator
        .age_batch(broken, Duration::from_secs(11 * 60))
        .await;

    let report = orchestrator.compensator(config()).run_sweep().await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.gathering_redelivered, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, broken);

    assert_eq!(orchestrator.status(healthy), BatchStatus::Diagnosing);
    assert_eq!(orchestrator.status(broken), BatchStatus::Diagnosing);
}

#[tokio::test]
async fn test_run_loop_sweeps_until_cancelled() {
    let orchestrator = TestOrchestrator::new();
    let batch_id = stuck_scattering_batch(&orchestrator).await;
    let compensator = orchestrator.compensator(config());
    let shutdown = CancellationToken::new();

    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { compensator.run(shutdown).await })
    };

    // The first tick fires immediately
    let mut advanced = false;
    for _ in 0..50 {
        if orchestrator.status(batch_id) == BatchStatus::Diagnosing {
            advanced = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(advanced);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
