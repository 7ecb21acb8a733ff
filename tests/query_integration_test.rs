//! Report cache and progress queries under concurrent load.

mod common;

use std::sync::Arc;
use std::time::Duration;

use argus_core::domain::{BatchStatus, DomainEvent};
use argus_core::error::ArgusError;
use argus_core::services::report_cache_key;
use common::TestOrchestrator;
use uuid::Uuid;

#[tokio::test]
async fn test_concurrent_cache_misses_hit_database_once() {
    let orchestrator = TestOrchestrator::new();
    let (batch, _) = orchestrator.uploaded_batch(2).await;
    let service = Arc::new(orchestrator.query_service());

    // Keep the leader's database read in flight while the others arrive
    orchestrator.reports.set_read_delay(Duration::from_millis(50));
    let sets_before = orchestrator.memory_store().op_counts().sets;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = Arc::clone(&service);
        let batch_id = batch.id;
        handles.push(tokio::spawn(async move { service.get_report(batch_id).await }));
    }

    let mut reports = Vec::new();
    let mut shared_count = 0;
    for handle in handles {
        let (report, shared) = handle.await.unwrap().unwrap();
        if shared {
            shared_count += 1;
        }
        reports.push(report);
    }

    assert_eq!(orchestrator.reports.read_count(), 1);
    assert_eq!(orchestrator.memory_store().op_counts().sets - sets_before, 1);
    assert_eq!(shared_count, 15);

    let first = serde_json::to_string(&reports[0]).unwrap();
    for report in &reports[1..] {
        assert_eq!(serde_json::to_string(report).unwrap(), first);
    }
    assert_eq!(reports[0].batch_id, batch.id);
    assert_eq!(reports[0].total_files, 2);
}

#[tokio::test]
async fn test_cache_serves_until_invalidated() {
    let orchestrator = TestOrchestrator::new();
    let (batch, file_ids) = orchestrator.scattering_batch(1).await;
    let service = orchestrator.query_service();

    let (before, _) = service.get_report(batch.id).await.unwrap();
    assert_eq!(before.status, BatchStatus::Scattering);
    assert!(orchestrator
        .memory_store()
        .contains_key(&report_cache_key(batch.id)));

    orchestrator
        .engine
        .handle_event(&DomainEvent::file_parsed(batch.id, file_ids[0]))
        .await
        .unwrap();

    // Still the cached projection
    let (cached, _) = service.get_report(batch.id).await.unwrap();
    assert_eq!(cached, before);

    service.invalidate_report(batch.id).await.unwrap();
    let (reloaded, _) = service.get_report(batch.id).await.unwrap();

    // The persisted projection wins over a fresh one
    assert_eq!(reloaded.id, before.id);
    assert_eq!(orchestrator.reports.read_count(), 2);
}

#[tokio::test]
async fn test_store_outage_degrades_to_database() {
    let orchestrator = TestOrchestrator::new();
    let (batch, _) = orchestrator.uploaded_batch(1).await;
    let service = orchestrator.query_service();
    orchestrator.memory_store().set_available(false);

    let (report, _) = service.get_report(batch.id).await.unwrap();
    assert_eq!(report.batch_id, batch.id);

    let (again, _) = service.get_report(batch.id).await.unwrap();
    assert_eq!(again.id, report.id);
    assert_eq!(orchestrator.reports.read_count(), 2);
}

#[tokio::test]
async fn test_database_failure_reaches_every_waiter() {
    let orchestrator = TestOrchestrator::new();
    let (batch, _) = orchestrator.uploaded_batch(1).await;
    let service = Arc::new(orchestrator.query_service());
    orchestrator.reports.set_read_delay(Duration::from_millis(30));
    orchestrator.reports.set_failing(true);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let service = Arc::clone(&service);
        let batch_id = batch.id;
        handles.push(tokio::spawn(async move { service.get_report(batch_id).await }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ArgusError::Database(_)));
    }

    // Failures are not remembered
    orchestrator.reports.set_failing(false);
    assert!(service.get_report(batch.id).await.is_ok());
}

#[tokio::test]
async fn test_progress_for_unknown_batch() {
    let orchestrator = TestOrchestrator::new();
    let id = Uuid::new_v4();
    assert_eq!(
        orchestrator
            .query_service()
            .get_progress(id)
            .await
            .unwrap_err(),
        ArgusError::NotFound(id)
    );
}

#[tokio::test]
async fn test_progress_after_scatter_uses_persisted_count() {
    let orchestrator = TestOrchestrator::new();
    let (batch, file_ids) = orchestrator.scattering_batch(2).await;
    for file_id in &file_ids {
        orchestrator
            .engine
            .handle_event(&DomainEvent::file_parsed(batch.id, *file_id))
            .await
            .unwrap();
    }

    let progress = orchestrator
        .query_service()
        .get_progress(batch.id)
        .await
        .unwrap();
    assert_eq!(progress.status, BatchStatus::Gathered);
    assert_eq!(progress.processed_files, 2);
    assert!((progress.progress_percent - 100.0).abs() < f64::EPSILON);
}
