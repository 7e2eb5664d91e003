//! Cutover sequence
//!
//! ```text
//! final check ─▶ freeze ─▶ drain to freeze LSN ─▶ repoint primary-write
//!             ─▶ unfreeze ─▶ probe write on target ─▶ Completed
//! ```
//!
//! Each step is persisted as it completes. A failure in any step after the
//! final check hands the job to the rollback manager. On restart the
//! endpoint registry, not the persisted step, decides the direction: if
//! `primary-write` already points at the target the cutover is finished,
//! otherwise it is rolled back.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{bounded, Coordinator};
use crate::db::Lsn;
use crate::error::{MigrationError, Result};
use crate::job::{CutoverProgress, CutoverStep, JobLease, JobState, MigrationJob};
use crate::registry::{EndpointRole, RepointOutcome};
use crate::replication::{LagReport, ReplicationError};

impl Coordinator {
    pub(super) async fn cutover_leased(
        &self,
        job_id: &str,
        lease: &JobLease,
    ) -> Result<MigrationJob> {
        let mut job = self.load_live(job_id).await?;
        match job.state {
            JobState::Synced => self.step_cutover(&mut job, lease).await?,
            JobState::CutoverInProgress => self.resume_cutover(&mut job, lease).await?,
            state => {
                return Err(MigrationError::InvalidState {
                    job_id: job_id.to_string(),
                    state,
                    operation: "cut over",
                })
            }
        }
        Ok(job)
    }

    /// Final check, then the cutover sequence. A failed final check leaves
    /// the job in `Synced`.
    pub(super) async fn step_cutover(&self, job: &mut MigrationJob, lease: &JobLease) -> Result<()> {
        if self.take_cancel(job).await? {
            return Ok(());
        }
        let Some(handle) = job.replication.clone() else {
            let err = MigrationError::Corrupt {
                job_id: job.spec.id.clone(),
                reason: "Synced without a replication handle".into(),
            };
            return Err(self.halt(job, err).await);
        };

        let lag = self.replication.poll_lag(&handle).await;
        if let Some(ref mut h) = job.replication {
            h.observe(&lag);
        }
        if !lag.within(job.spec.lag_tolerance()) {
            let err = MigrationError::Validation(match lag {
                LagReport::Known(ref sample) => format!(
                    "lag of {} bytes is outside the {}ms tolerance",
                    sample.bytes_behind, job.spec.lag_tolerance_ms
                ),
                LagReport::Unknown { ref reason } => format!("lag unknown: {reason}"),
            });
            return Err(self.halt(job, err).await);
        }

        let check = match self.validator.check(job).await {
            Ok(check) => check,
            Err(e) => return Err(self.halt(job, e.into()).await),
        };
        let trusted = check
            .lag_bytes
            .is_some_and(|lag| lag <= self.config.trusted_lag_bytes);
        let passed = check.passed && trusted;
        let failing: Vec<String> = check.failing_tables().into_iter().map(String::from).collect();
        let lag_bytes = check.lag_bytes;
        job.record_check(check);
        if !passed {
            let err = MigrationError::Validation(if trusted {
                format!("final consistency check failed on {failing:?}")
            } else {
                format!("final consistency check taken at lag {lag_bytes:?} is not trusted")
            });
            return Err(self.halt(job, err).await);
        }

        job.cutover = Some(CutoverProgress::start());
        job.complete_step(CutoverStep::FinalCheckPassed);
        self.commit(job, JobState::CutoverInProgress, "final consistency check passed")
            .await?;

        match self.cutover_sequence(job, lease).await {
            Ok(()) => self.complete(job).await,
            Err(cause) => self.abort_cutover(job, cause).await,
        }
    }

    /// Finish or reverse a cutover interrupted by a restart.
    pub(super) async fn resume_cutover(&self, job: &mut MigrationJob, lease: &JobLease) -> Result<()> {
        let target = job.spec.target.clone();
        let repointed =
            self.endpoints.connection(EndpointRole::PrimaryWrite).as_deref() == Some(target.as_str());
        if !repointed {
            info!(
                job_id = job.id(),
                last_step = ?job.cutover.as_ref().and_then(|c| c.last_step),
                "cutover interrupted before repoint, rolling back"
            );
            return self.roll_back(job, "cutover interrupted before repoint").await;
        }

        info!(job_id = job.id(), "cutover interrupted after repoint, verifying target");
        match self.verify_repointed(job, lease).await {
            Ok(()) => self.complete(job).await,
            Err(cause) => self.abort_cutover(job, cause).await,
        }
    }

    async fn cutover_sequence(&self, job: &mut MigrationJob, lease: &JobLease) -> Result<()> {
        let job_id = job.spec.id.clone();
        let hook_timeout = self.config.freeze_timeout();

        bounded(hook_timeout, "freeze acknowledgement", self.hook.freeze(&job_id)).await?;
        let frozen_at = Instant::now();
        let freeze_lsn = self.replication.source_lsn(&job.spec.source).await?;
        if let Some(ref mut progress) = job.cutover {
            progress.freeze_lsn = Some(freeze_lsn);
        }
        self.persist_step(job, CutoverStep::Frozen, lease).await?;

        self.drain(job, freeze_lsn).await?;
        self.persist_step(job, CutoverStep::Drained, lease).await?;

        let proof = self.registry.confirm_live(&job.spec.target).await?;
        let outcome = self
            .endpoints
            .repoint(EndpointRole::PrimaryWrite, &proof)
            .await?;
        debug!(job_id = %job_id, ?outcome, "primary-write repointed");
        self.persist_step(job, CutoverStep::Repointed, lease).await?;

        bounded(hook_timeout, "unfreeze acknowledgement", self.hook.unfreeze(&job_id)).await?;
        info!(
            job_id = %job_id,
            write_pause_ms = frozen_at.elapsed().as_millis() as u64,
            "application writes resumed on target"
        );
        self.persist_step(job, CutoverStep::Unfrozen, lease).await?;

        self.probe_target(job).await?;
        self.persist_step(job, CutoverStep::Probed, lease).await
    }

    /// Re-confirm the target, make sure writes are unfrozen, and probe.
    async fn verify_repointed(&self, job: &mut MigrationJob, lease: &JobLease) -> Result<()> {
        self.registry.confirm_live(&job.spec.target).await?;
        if !job.step_reached(CutoverStep::Repointed) {
            self.persist_step(job, CutoverStep::Repointed, lease).await?;
        }
        if !job.step_reached(CutoverStep::Unfrozen) {
            let job_id = job.spec.id.clone();
            bounded(
                self.config.freeze_timeout(),
                "unfreeze acknowledgement",
                self.hook.unfreeze(&job_id),
            )
            .await?;
            self.persist_step(job, CutoverStep::Unfrozen, lease).await?;
        }
        self.probe_target(job).await?;
        self.persist_step(job, CutoverStep::Probed, lease).await
    }

    /// Wait until the target has confirmed everything up to `freeze_lsn`.
    async fn drain(&self, job: &mut MigrationJob, freeze_lsn: Lsn) -> Result<()> {
        let Some(handle) = job.replication.clone() else {
            return Err(MigrationError::Corrupt {
                job_id: job.spec.id.clone(),
                reason: "cutover without a replication handle".into(),
            });
        };
        let budget = Duration::from_millis(self.config.final_sync_timeout_ms);
        let poll = Duration::from_millis((self.config.poll_interval_ms / 4).max(10));
        let caught_up = async {
            loop {
                let report = self.replication.poll_lag(&handle).await;
                if let LagReport::Known(ref sample) = report {
                    if sample.confirmed_lsn >= freeze_lsn {
                        return report;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };
        match tokio::time::timeout(budget, caught_up).await {
            Ok(report) => {
                if let Some(ref mut h) = job.replication {
                    h.observe(&report);
                }
                Ok(())
            }
            Err(_) => {
                // The error context carries the lag the target was left at.
                let report = self.replication.poll_lag(&handle).await;
                if let Some(ref mut h) = job.replication {
                    h.observe(&report);
                }
                Err(MigrationError::Timeout(format!(
                    "target did not reach freeze position {freeze_lsn} within {}ms",
                    budget.as_millis()
                )))
            }
        }
    }

    async fn probe_target(&self, job: &MigrationJob) -> Result<()> {
        let budget = Duration::from_millis(self.config.probe_timeout_ms);
        let target = job.spec.target.as_str();
        bounded(budget, "target probe write", async {
            let db = self.registry.resolve(target).await?;
            db.probe_write()
                .await
                .map_err(|e| MigrationError::Replication(ReplicationError::Target(e)))
        })
        .await
    }

    async fn persist_step(
        &self,
        job: &mut MigrationJob,
        step: CutoverStep,
        lease: &JobLease,
    ) -> Result<()> {
        if !lease.is_valid() {
            return Err(MigrationError::LeaseLost(job.spec.id.clone()));
        }
        job.complete_step(step);
        self.jobs.save(job).await?;
        debug!(job_id = job.id(), ?step, "cutover step persisted");
        Ok(())
    }

    async fn complete(&self, job: &mut MigrationJob) -> Result<()> {
        self.move_read_only(job).await;
        if let Some(handle) = job.replication.clone() {
            if let Err(e) = self.replication.teardown(&handle).await {
                warn!(
                    job_id = job.id(),
                    slot = %handle.slot,
                    error = %e,
                    "teardown after cutover failed; the next sweep will retry"
                );
            }
        }
        let elapsed_ms = job
            .cutover
            .as_ref()
            .map(|c| (Utc::now() - c.started_at).num_milliseconds().max(0))
            .unwrap_or_default();
        let reason = format!("cutover finished in {elapsed_ms}ms");
        self.commit(job, JobState::Completed, reason).await
    }

    /// Point `read-only` at the target too if it still serves the source.
    async fn move_read_only(&self, job: &MigrationJob) {
        if self.endpoints.connection(EndpointRole::ReadOnly).as_deref()
            != Some(job.spec.source.as_str())
        {
            return;
        }
        let result = async {
            let proof = self.registry.confirm_live(&job.spec.target).await?;
            self.endpoints.repoint(EndpointRole::ReadOnly, &proof).await
        }
        .await;
        match result {
            Ok(RepointOutcome::Changed { from, to }) => {
                info!(job_id = job.id(), ?from, %to, "read-only endpoint repointed")
            }
            Ok(RepointOutcome::Unchanged) => {}
            Err(e) => warn!(job_id = job.id(), error = %e, "read-only endpoint left on source"),
        }
    }

    /// Record the failed step and roll back. A lost lease means another
    /// process now owns the job, so nothing is reversed here.
    async fn abort_cutover(&self, job: &mut MigrationJob, cause: MigrationError) -> Result<()> {
        if matches!(cause, MigrationError::LeaseLost(_)) {
            return Err(cause);
        }
        let state = job.state;
        warn!(job_id = job.id(), error = %cause, "cutover step failed, rolling back");
        let facts = self.record(job, &cause);
        self.roll_back(job, &format!("cutover failed: {cause}")).await?;
        Err(cause.for_job(job.id(), state, facts))
    }
}
