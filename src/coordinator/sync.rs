//! Syncing: lag monitoring and background validation until convergence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::Coordinator;
use crate::error::{MigrationError, Result};
use crate::job::{JobLease, JobState, MigrationJob};
use crate::replication::{LagReport, ReplicationController, ReplicationSlotHandle};
use crate::validator::{ConsistencyCheckResult, ConsistencyValidator, ValidatorError};

enum SyncEvent {
    Lag(LagReport),
    Check(std::result::Result<ConsistencyCheckResult, ValidatorError>),
}

/// Background tasks feeding the sync loop; aborted when dropped.
struct Monitors {
    lag: JoinHandle<()>,
    validation: JoinHandle<()>,
}

impl Drop for Monitors {
    fn drop(&mut self) {
        self.lag.abort();
        self.validation.abort();
    }
}

impl Coordinator {
    /// Stay in `Syncing` until lag has been within tolerance for the
    /// convergence window and a passing check was taken inside that window.
    pub(super) async fn step_sync(&self, job: &mut MigrationJob, lease: &JobLease) -> Result<()> {
        let Some(handle) = job.replication.clone() else {
            let err = MigrationError::Corrupt {
                job_id: job.spec.id.clone(),
                reason: "Syncing without a replication handle".into(),
            };
            return Err(self.fail(job, err).await);
        };
        let tolerance = job.spec.lag_tolerance();
        let window = Duration::from_millis(self.config.convergence_window_ms);
        let budget = Duration::from_secs(self.config.max_sync_duration_secs);
        let deadline = Instant::now() + budget;

        let (tx, mut events) = mpsc::channel(16);
        let (trigger, trigger_rx) = mpsc::channel(1);
        let _monitors = Monitors {
            lag: tokio::spawn(lag_monitor(
                Arc::clone(&self.replication),
                handle,
                self.config.poll_interval(),
                tx.clone(),
            )),
            validation: tokio::spawn(validation_monitor(
                Arc::clone(&self.validator),
                job.clone(),
                Duration::from_millis(self.config.validation_interval_ms.max(1)),
                trigger_rx,
                tx,
            )),
        };

        // Start of the current in-tolerance streak.
        let mut converged_since: Option<(Instant, DateTime<Utc>)> = None;
        let mut check_requested = false;

        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.sync_deadline(job, converged_since.is_some(), budget).await);
                }
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return Err(self
                    .halt(job, MigrationError::Timeout("sync monitors stopped".into()))
                    .await);
            };
            if !lease.is_valid() {
                return Err(MigrationError::LeaseLost(job.spec.id.clone()));
            }
            if self.take_cancel(job).await? {
                return Ok(());
            }

            match event {
                SyncEvent::Lag(report) => {
                    if let Some(ref mut handle) = job.replication {
                        handle.observe(&report);
                    }
                    match report {
                        LagReport::Unknown { ref reason } => {
                            warn!(job_id = job.id(), %reason, "lag unknown");
                            converged_since = None;
                        }
                        ref known if known.within(tolerance) => {
                            if converged_since.is_none() {
                                debug!(job_id = job.id(), "lag within tolerance");
                                converged_since = Some((Instant::now(), Utc::now()));
                            }
                        }
                        LagReport::Known(ref sample) => {
                            if converged_since.take().is_some() {
                                debug!(
                                    job_id = job.id(),
                                    bytes_behind = sample.bytes_behind,
                                    "lag left tolerance"
                                );
                            }
                        }
                    }
                    self.jobs.save(job).await?;
                }
                SyncEvent::Check(Ok(result)) => {
                    check_requested = false;
                    let passed = result.passed;
                    let failing: Vec<String> =
                        result.failing_tables().into_iter().map(String::from).collect();
                    let lag_bytes = result.lag_bytes;
                    job.record_check(result);
                    if passed {
                        self.jobs.save(job).await?;
                    } else {
                        let err = MigrationError::Validation(format!(
                            "consistency check failed on {failing:?} (lag {lag_bytes:?} bytes)"
                        ));
                        warn!(job_id = job.id(), error = %err, "consistency check failed, still syncing");
                        self.record(job, &err);
                        self.jobs.save(job).await?;
                    }
                }
                SyncEvent::Check(Err(e)) => {
                    check_requested = false;
                    warn!(job_id = job.id(), error = %e, "consistency check could not run");
                }
            }

            let Some((since, since_at)) = converged_since else {
                continue;
            };
            if since.elapsed() < window {
                continue;
            }
            let fresh = job
                .trusted_check(self.config.trusted_lag_bytes)
                .filter(|check| check.checked_at >= since_at)
                .map(|check| (check.passed, check.checked_at));
            match fresh {
                Some((true, checked_at)) => {
                    let reason = format!(
                        "lag within {}ms for {}ms; check at {} passed",
                        tolerance.as_millis(),
                        since.elapsed().as_millis(),
                        checked_at.to_rfc3339()
                    );
                    info!(job_id = job.id(), "replication converged");
                    self.commit(job, JobState::Synced, reason).await?;
                    return Ok(());
                }
                // A failing check from this window waits for the next run.
                Some((false, _)) => {}
                None if !check_requested => {
                    debug!(job_id = job.id(), "requesting consistency check");
                    check_requested = trigger.try_send(()).is_ok();
                }
                None => {}
            }
        }
    }

    /// Out of sync time. Lag that converged but never earned a passing check
    /// is a data problem: the job halts in `Syncing` with replication kept
    /// for inspection. Lag that never converged fails the job.
    async fn sync_deadline(
        &self,
        job: &mut MigrationJob,
        lag_converged: bool,
        budget: Duration,
    ) -> MigrationError {
        let failing: Option<Vec<String>> = job
            .trusted_check(self.config.trusted_lag_bytes)
            .filter(|check| !check.passed)
            .map(|check| check.failing_tables().into_iter().map(String::from).collect());
        if let (true, Some(failing)) = (lag_converged, failing) {
            warn!(
                job_id = job.id(),
                budget_secs = budget.as_secs(),
                ?failing,
                "lag converged but consistency checks keep failing"
            );
            let err = MigrationError::Validation(format!(
                "lag converged but no consistency check passed within {}s; failing tables {failing:?}",
                budget.as_secs()
            ));
            return self.halt(job, err).await;
        }
        warn!(job_id = job.id(), budget_secs = budget.as_secs(), "replication did not converge");
        self.teardown_quietly(job).await;
        let err = MigrationError::NotConverged { secs: budget.as_secs() };
        self.fail(job, err).await
    }
}

async fn lag_monitor(
    controller: Arc<ReplicationController>,
    handle: ReplicationSlotHandle,
    every: Duration,
    tx: mpsc::Sender<SyncEvent>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let report = controller.poll_lag(&handle).await;
        if tx.send(SyncEvent::Lag(report)).await.is_err() {
            break;
        }
    }
}

async fn validation_monitor(
    validator: Arc<ConsistencyValidator>,
    job: MigrationJob,
    every: Duration,
    mut trigger: mpsc::Receiver<()>,
    tx: mpsc::Sender<SyncEvent>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first check runs
    // once replication has had a chance to apply.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = trigger.recv() => {}
        }
        let result = validator.check(&job).await;
        if tx.send(SyncEvent::Check(result)).await.is_err() {
            break;
        }
    }
}
