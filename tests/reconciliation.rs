//! Restart behaviour: orphan sweeps, resumption and retries.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pgshift::job::{JobState, MigrationJob};
use pgshift::MigrationError;

#[tokio::test]
async fn test_sweep_removes_orphans_and_keeps_live_slots() {
    let h = Harness::new().await;
    h.orchestrator
        .coordinator
        .start(users_spec("orders"))
        .await
        .unwrap();
    h.source().create_slot("pgshift_ghost");

    let report = h.orchestrator.coordinator.reconcile(false).await.unwrap();
    assert!(report.sweep.errors.is_empty(), "{:?}", report.sweep.errors);
    assert_eq!(report.sweep.torn_down, vec!["legacy/pgshift_ghost".to_string()]);
    assert!(report.resumed.is_empty());
    assert!(!h.source().has_slot("pgshift_ghost"));
    assert!(h.source().has_slot("pgshift_orders"));
}

#[tokio::test]
async fn test_sweep_ignores_foreign_slots() {
    let h = Harness::new().await;
    h.source().create_slot("debezium_main");
    let report = h.orchestrator.coordinator.sweep_orphans().await;
    assert!(report.torn_down.is_empty());
    assert!(h.source().has_slot("debezium_main"));
}

#[tokio::test]
async fn test_job_killed_mid_sync_resumes_after_restart() {
    let h = Harness::with(|c| c.coordinator.convergence_window_ms = 2_000).await;
    let coordinator = Arc::clone(&h.orchestrator.coordinator);
    let run = tokio::spawn(async move { coordinator.start(users_spec("orders")).await });

    h.wait_for("orders", |j| j.state == JobState::Syncing).await;
    run.abort();
    assert!(run.await.unwrap_err().is_cancelled());

    // A new process cannot take the job until the dead holder's lease lapses.
    let restarted = h.restart().await;
    let err = restarted.coordinator.drive("orders").await.unwrap_err();
    assert!(matches!(err, MigrationError::Lease(_)));
    tokio::time::sleep(Duration::from_millis(1_200)).await;

    h.source().insert("users", &["4", "dee@example.com"]).unwrap();
    let report = restarted.coordinator.reconcile(true).await.unwrap();
    assert_eq!(
        report.resumed,
        vec![("orders".to_string(), JobState::Synced)]
    );
    assert_eq!(h.target().rows("users").len(), 4);

    // Never exported twice: the resumed attempt kept the original snapshot.
    let job = restarted.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.attempt, 1);
    let exports = job
        .transitions
        .iter()
        .filter(|t| t.to == JobState::SnapshotExported)
        .count();
    assert_eq!(exports, 1);
}

#[tokio::test]
async fn test_retry_after_rollback_reuses_retained_slot() {
    let h = Harness::new().await;
    let coordinator = &h.orchestrator.coordinator;
    let first = coordinator.start(users_spec("orders")).await.unwrap();
    let snapshot_key = first.snapshot.clone().unwrap().key;

    let rolled_back = coordinator.rollback("orders").await.unwrap();
    assert_eq!(rolled_back.state, JobState::RolledBack);
    assert!(h.source().has_slot("pgshift_orders"));
    assert!(h.target().has_subscription("pgshift_orders"));

    h.source().insert("users", &["4", "dee@example.com"]).unwrap();
    let second = coordinator.retry("orders").await.unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(second.state, JobState::Synced);
    assert_eq!(second.snapshot.unwrap().key, snapshot_key);
    assert!(second.transitions[0].reason.starts_with("reusing retained snapshot"));
    assert_eq!(h.target().rows("users").len(), 4);

    let archived: MigrationJob = coordinator.jobs().load_archived("orders").await.unwrap().unwrap();
    assert_eq!(archived.state, JobState::RolledBack);
}

#[tokio::test]
async fn test_retry_refused_while_job_is_live() {
    let h = Harness::new().await;
    let coordinator = &h.orchestrator.coordinator;
    coordinator.start(users_spec("orders")).await.unwrap();
    let err = coordinator.retry("orders").await.unwrap_err();
    assert!(matches!(err, MigrationError::InvalidState { .. }));
}

#[tokio::test]
async fn test_sync_deadline_fails_job_and_tears_down() {
    let h = Harness::with(|c| {
        c.coordinator.max_sync_duration_secs = 1;
        c.coordinator.convergence_window_ms = 500;
    })
    .await;
    let coordinator = Arc::clone(&h.orchestrator.coordinator);
    let run = tokio::spawn(async move { coordinator.start(users_spec("orders")).await });
    h.wait_for("orders", |j| j.state == JobState::Syncing).await;
    h.target().pause_apply(true);
    h.source().insert("users", &["4", "dee@example.com"]).unwrap();

    let err = run.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("did not converge"), "{err}");
    let job = h.orchestrator.coordinator.jobs().load("orders").await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(!h.source().has_slot("pgshift_orders"));
}
