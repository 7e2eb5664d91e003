//! Failover drills against a fake cluster API after a migration completes.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;

use common::*;
use pgshift::failover::FailoverConfig;
use pgshift::job::JobState;
use pgshift::MigrationError;

async fn harness_with_cluster() -> Harness {
    let mut h = Harness::with(|c| {
        c.coordinator.auto_cutover = true;
        c.failover = FailoverConfig {
            promotion_timeout_secs: 2,
            write_window_secs: 1,
            poll_interval_ms: 10,
            ..Default::default()
        };
    })
    .await;
    let config = h.orchestrator.config.clone();
    h.orchestrator = build(
        config,
        &h.network,
        &h.store,
        &h.hook,
        &h.sink,
        Some(Arc::new(FakeCluster::new("pg-1", "pg-2"))),
    )
    .await;
    h
}

#[tokio::test]
async fn test_drill_refused_before_migration_completes() {
    let h = harness_with_cluster().await;
    let err = h
        .orchestrator
        .coordinator
        .check_failover_allowed(TARGET)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Failover(_)), "{err}");
}

#[tokio::test]
async fn test_drill_after_cutover_meets_sla() {
    let h = harness_with_cluster().await;
    let job = h
        .orchestrator
        .coordinator
        .start(users_spec("orders"))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
    h.orchestrator
        .coordinator
        .check_failover_allowed(TARGET)
        .await
        .unwrap();

    let report = h
        .orchestrator
        .failover_harness()
        .unwrap()
        .simulate_primary_loss(TARGET)
        .await
        .unwrap();
    assert_eq!(report.deleted_primary, "pg-1");
    assert_eq!(report.new_primary.as_deref(), Some("pg-2"));
    assert!(report.within_sla);
    assert!(report.write_accepted);
}

#[tokio::test]
async fn test_no_harness_without_cluster_api() {
    let h = Harness::new().await;
    assert!(h.orchestrator.failover_harness().is_none());
}
