//! Cutover failures and restarts in the middle of the sequence.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use pgshift::job::{CutoverStep, JobState};
use pgshift::registry::EndpointRole;
use pgshift::{ErrorClass, MigrationError};

async fn synced(h: &Harness) {
    let job = h
        .orchestrator
        .coordinator
        .start(users_spec("orders"))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Synced);
}

fn primary(h: &Harness) -> Option<String> {
    h.orchestrator
        .endpoints
        .connection(EndpointRole::PrimaryWrite)
}

#[tokio::test]
async fn test_failed_probe_rolls_back() {
    let h = Harness::new().await;
    synced(&h).await;
    h.target().set_read_only(true);

    let err = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);

    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert!(!job.requires_operator);
    assert_eq!(job.cutover.unwrap().last_step, Some(CutoverStep::Unfrozen));
    assert_eq!(primary(&h).as_deref(), Some(SOURCE));
    // once by the sequence, once by the rollback
    assert_eq!(h.hook.unfreezes(), 2);
    // replication is kept for a retry
    assert!(h.source().has_slot("pgshift_orders"));
}

#[tokio::test]
async fn test_refused_freeze_rolls_back_without_repoint() {
    let h = Harness::new().await;
    synced(&h).await;
    h.hook.refuse_freeze.store(true, Ordering::SeqCst);

    let err = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();
    assert!(err.to_string().contains("freeze"), "{err}");
    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(primary(&h).as_deref(), Some(SOURCE));
}

#[tokio::test]
async fn test_final_check_failure_stays_synced() {
    let h = Harness::new().await;
    synced(&h).await;
    h.source()
        .corrupt("users", "3", 1, "mallory@example.com")
        .unwrap();

    let err = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert_eq!(err.exit_code(), 65);
    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::Synced);
    assert!(job.cutover.is_none());
    assert_eq!(h.hook.freezes(), 0);
}

#[tokio::test]
async fn test_drain_timeout_rolls_back_with_lag_recorded() {
    let h = Harness::new().await;
    synced(&h).await;
    let (source, target) = (h.source(), h.target());
    *h.hook.on_freeze.lock() = Some(Box::new(move || {
        target.pause_apply(true);
        source.insert("users", &["4", "dee@example.com"]).unwrap();
    }));

    let err = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient, "{err}");
    assert!(err.to_string().contains("freeze position"), "{err}");

    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(job.cutover.as_ref().unwrap().last_step, Some(CutoverStep::Frozen));
    assert_eq!(primary(&h).as_deref(), Some(SOURCE));
    assert_eq!(h.hook.unfreezes(), 1);

    let error = job.last_error.unwrap();
    let lag: u64 = error.context["lag_bytes"].parse().unwrap();
    assert!(lag > 0, "lag recorded as {lag}");
    assert!(error.context.contains_key("freeze_lsn"));
    assert!(h.source().has_slot("pgshift_orders"));
}

#[tokio::test]
async fn test_restart_after_repoint_completes() {
    let h = Harness::with(|c| c.coordinator.freeze_timeout_ms = 10_000).await;
    synced(&h).await;
    h.hook.hang_unfreeze.store(true, Ordering::SeqCst);

    let coordinator = Arc::clone(&h.orchestrator.coordinator);
    let run = tokio::spawn(async move { coordinator.cutover("orders").await });
    h.wait_for("orders", |j| j.step_reached(CutoverStep::Repointed))
        .await;
    run.abort();
    let _ = run.await;
    assert_eq!(primary(&h).as_deref(), Some(TARGET));

    h.hook.hang_unfreeze.store(false, Ordering::SeqCst);
    let job = h.orchestrator.coordinator.cutover("orders").await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(primary(&h).as_deref(), Some(TARGET));
    assert_eq!(h.hook.unfreezes(), 1);
    assert!(!h.source().has_slot("pgshift_orders"));
}

#[tokio::test]
async fn test_restart_before_repoint_rolls_back() {
    let h = Harness::with(|c| c.coordinator.final_sync_timeout_ms = 10_000).await;
    synced(&h).await;
    // A last write lands as writes freeze, and the target stops applying.
    let (source, target) = (h.source(), h.target());
    *h.hook.on_freeze.lock() = Some(Box::new(move || {
        target.pause_apply(true);
        source.insert("users", &["4", "dee@example.com"]).unwrap();
    }));

    let coordinator = Arc::clone(&h.orchestrator.coordinator);
    let run = tokio::spawn(async move { coordinator.cutover("orders").await });
    let frozen = h
        .wait_for("orders", |j| j.step_reached(CutoverStep::Frozen))
        .await;
    assert_eq!(frozen.state, JobState::CutoverInProgress);
    run.abort();
    let _ = run.await;
    h.target().pause_apply(false);

    // Resuming from a fresh process goes back to the source.
    tokio::time::sleep(std::time::Duration::from_millis(1_200)).await;
    let restarted = h.restart().await;
    let job = restarted.coordinator.drive("orders").await.unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(
        restarted
            .endpoints
            .connection(EndpointRole::PrimaryWrite)
            .as_deref(),
        Some(SOURCE)
    );
    assert_eq!(h.hook.unfreezes(), 1);
}

#[tokio::test]
async fn test_rollback_twice_leaves_identical_endpoints() {
    let h = Harness::new().await;
    synced(&h).await;
    h.target().set_read_only(true);
    let _ = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();

    let endpoints = &h.orchestrator.endpoints;
    let after_first = endpoints.snapshot();
    let job = h.orchestrator.coordinator.rollback("orders").await.unwrap();
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(endpoints.snapshot(), after_first);

    h.orchestrator.coordinator.rollback("orders").await.unwrap();
    assert_eq!(endpoints.snapshot(), after_first);
}

#[tokio::test]
async fn test_failed_rollback_needs_operator() {
    let h = Harness::new().await;
    synced(&h).await;
    h.hook.hang_unfreeze.store(true, Ordering::SeqCst);

    let err = h.orchestrator.coordinator.cutover("orders").await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Job(ref e) if matches!(e.source, MigrationError::Rollback(_))
    ));
    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.requires_operator);

    // The sweep leaves its slot for the operator and retry is refused.
    let report = h.orchestrator.coordinator.sweep_orphans().await;
    assert_eq!(report.skipped.len(), 1);
    assert!(h.source().has_slot("pgshift_orders"));
    let err = h.orchestrator.coordinator.retry("orders").await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
}
