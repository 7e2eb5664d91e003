//! Cutover Coordinator
//!
//! The coordinator owns every job record and is the only component that
//! commits state transitions. One process drives a job at a time, enforced
//! by a [`JobLease`]; everything it learns is persisted before it acts on
//! it, so driving a job again after a crash resumes from the stored state.
//!
//! ```text
//! Initiated ──export──▶ SnapshotExported ──establish──▶ ReplicationEstablished
//!     ──▶ Syncing ──lag converged + trusted check──▶ Synced
//!     ──final check──▶ CutoverInProgress ──freeze/drain/repoint/unfreeze/probe──▶ Completed
//! ```
//!
//! Failures before cutover move the job to `Failed` and tear replication
//! down. Failures during cutover go through the [`RollbackManager`]; if the
//! rollback itself fails the job is `Failed` with `requires_operator` set.

mod cutover;
mod sync;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MigrationError, Result};
use crate::failover::FailoverError;
use crate::hooks::FreezeHook;
use crate::job::lease::LeaseRecord;
use crate::job::{
    ErrorRecord, JobLease, JobSpec, JobState, JobStore, JobStoreError, LeaseError, LeaseManager,
    MigrationJob,
};
use crate::metrics;
use crate::notify::{Notifier, TransitionEvent};
use crate::registry::{ConnectionRegistry, EndpointRegistry, EndpointRole, RegistryError};
use crate::replication::{self, ReplicationController, SweepReport};
use crate::rollback::RollbackManager;
use crate::snapshot::SnapshotExporter;
use crate::validator::ConsistencyValidator;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Lag poll interval while syncing.
    pub poll_interval_ms: u64,
    /// How long lag must stay within tolerance before `Synced`.
    pub convergence_window_ms: u64,
    /// Give up syncing after this long.
    pub max_sync_duration_secs: u64,
    /// Interval between background consistency checks.
    pub validation_interval_ms: u64,
    /// Checks taken with more lag than this are not trusted.
    pub trusted_lag_bytes: u64,
    /// Export attempts while the source is unreachable.
    pub export_attempts: u32,
    /// Bounded wait for freeze and unfreeze acknowledgements.
    pub freeze_timeout_ms: u64,
    /// Bounded wait for the target to reach the freeze position.
    pub final_sync_timeout_ms: u64,
    /// Bounded wait for the post-cutover probe write.
    pub probe_timeout_ms: u64,
    /// Job lease time-to-live.
    pub lease_ttl_secs: u64,
    /// Continue from `Synced` into cutover without an operator.
    pub auto_cutover: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            convergence_window_ms: 10_000,
            max_sync_duration_secs: 6 * 3_600,
            validation_interval_ms: 60_000,
            trusted_lag_bytes: 64 * 1024,
            export_attempts: 3,
            freeze_timeout_ms: 10_000,
            final_sync_timeout_ms: 5_000,
            probe_timeout_ms: 3_000,
            lease_ttl_secs: 30,
            auto_cutover: false,
        }
    }
}

impl CoordinatorConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn freeze_timeout(&self) -> Duration {
        Duration::from_millis(self.freeze_timeout_ms)
    }

    /// Lease TTL as a duration.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Everything the coordinator drives.
pub struct CoordinatorParts {
    /// Named connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Role to connection mapping.
    pub endpoints: Arc<EndpointRegistry>,
    /// Job records.
    pub jobs: JobStore,
    /// Job leases.
    pub leases: LeaseManager,
    /// Snapshot exporter.
    pub exporter: SnapshotExporter,
    /// Replication controller.
    pub replication: Arc<ReplicationController>,
    /// Consistency validator.
    pub validator: Arc<ConsistencyValidator>,
    /// Application freeze hook.
    pub hook: Arc<dyn FreezeHook>,
    /// Transition notifications.
    pub notifier: Arc<Notifier>,
}

/// Point-in-time view of a job for `status`.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Latest record.
    pub job: MigrationJob,
    /// Whether the record came from the archive.
    pub archived: bool,
    /// Current lease, if someone is driving the job.
    pub lease: Option<LeaseRecord>,
    /// Connection serving `primary-write`.
    pub primary_write: Option<String>,
    /// A cancel is waiting to be honoured.
    pub cancel_requested: bool,
}

/// Result of an operator cancel.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// Nobody was driving the job; it was cancelled on the spot.
    Applied(MigrationJob),
    /// The driving process will honour the cancel at its next poll.
    Requested {
        /// Current lease holder.
        owner: String,
    },
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Orphaned slot sweep.
    pub sweep: SweepReport,
    /// Jobs driven again, with the state they ended in.
    pub resumed: Vec<(String, JobState)>,
    /// Jobs another process is driving.
    pub busy: Vec<String>,
    /// Jobs whose resumption failed.
    pub errors: Vec<(String, String)>,
}

/// The migration state machine.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<ConnectionRegistry>,
    endpoints: Arc<EndpointRegistry>,
    jobs: JobStore,
    leases: LeaseManager,
    exporter: SnapshotExporter,
    replication: Arc<ReplicationController>,
    validator: Arc<ConsistencyValidator>,
    rollback: RollbackManager,
    hook: Arc<dyn FreezeHook>,
    notifier: Arc<Notifier>,
}

impl Coordinator {
    /// Assemble a coordinator.
    pub fn new(config: CoordinatorConfig, parts: CoordinatorParts) -> Self {
        let rollback = RollbackManager::new(
            Arc::clone(&parts.registry),
            Arc::clone(&parts.endpoints),
            Arc::clone(&parts.hook),
            config.freeze_timeout(),
        );
        Self {
            config,
            registry: parts.registry,
            endpoints: parts.endpoints,
            jobs: parts.jobs,
            leases: parts.leases,
            exporter: parts.exporter,
            replication: parts.replication,
            validator: parts.validator,
            rollback,
            hook: parts.hook,
            notifier: parts.notifier,
        }
    }

    /// Coordinator configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Job records.
    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Endpoint registry.
    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    // -----------------------------------------------------------------------
    // Operator entry points
    // -----------------------------------------------------------------------

    /// Accept a new job and drive it as far as it goes without an operator:
    /// `Synced`, or `Completed` with `auto_cutover`.
    pub async fn start(&self, spec: JobSpec) -> Result<MigrationJob> {
        spec.validate()?;
        for name in [&spec.source, &spec.target] {
            if self.registry.info(name).is_none() {
                return Err(RegistryError::UnresolvedRole(name.clone()).into());
            }
        }
        match self.jobs.load(&spec.id).await {
            Ok(existing) => {
                return Err(JobStoreError::AlreadyExists {
                    id: existing.spec.id,
                    state: existing.state,
                }
                .into())
            }
            Err(JobStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let job = MigrationJob::new(spec);
        self.jobs.create(&job).await?;
        info!(
            job_id = job.id(),
            source = %job.spec.source,
            target = %job.spec.target,
            tables = job.spec.tables.len(),
            "migration job accepted"
        );
        self.drive(&job.spec.id).await
    }

    /// Drive a job from its persisted state.
    pub async fn drive(&self, job_id: &str) -> Result<MigrationJob> {
        let lease = self.leases.acquire(job_id).await?;
        let result = self.drive_leased(job_id, &lease).await;
        release(lease).await;
        result
    }

    /// Run the cutover sequence of a `Synced` job, or finish an interrupted one.
    pub async fn cutover(&self, job_id: &str) -> Result<MigrationJob> {
        let lease = self.leases.acquire(job_id).await?;
        let result = self.cutover_leased(job_id, &lease).await;
        release(lease).await;
        result
    }

    /// Operator rollback. On a job already rolled back it re-asserts the
    /// endpoint state without touching the record.
    pub async fn rollback(&self, job_id: &str) -> Result<MigrationJob> {
        let lease = self.leases.acquire(job_id).await?;
        let result = async {
            let mut job = self.jobs.load(job_id).await?;
            match job.state {
                JobState::RolledBack => {
                    self.rollback.rollback(&job).await?;
                    info!(job_id, "job already rolled back; endpoints re-asserted");
                }
                JobState::Completed | JobState::Failed => {
                    return Err(MigrationError::InvalidState {
                        job_id: job_id.to_string(),
                        state: job.state,
                        operation: "roll back",
                    })
                }
                _ => self.roll_back(&mut job, "operator requested rollback").await?,
            }
            Ok(job)
        }
        .await;
        release(lease).await;
        result
    }

    /// Ask for a job to stop. Only `Syncing` and `Synced` jobs can be
    /// cancelled; a cancelled job ends `Failed` with replication torn down.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let job = self.load_live(job_id).await?;
        if !job.state.is_cancellable() {
            return Err(MigrationError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "cancel",
            });
        }
        self.jobs.request_cancel(job_id).await?;
        info!(job_id, state = %job.state, "cancel requested");

        match self.leases.acquire(job_id).await {
            Ok(lease) => {
                let result = async {
                    let mut job = self.load_live(job_id).await?;
                    self.take_cancel(&mut job).await?;
                    Ok(CancelOutcome::Applied(job))
                }
                .await;
                release(lease).await;
                result
            }
            Err(LeaseError::Held { owner, .. }) => Ok(CancelOutcome::Requested { owner }),
            Err(e) => Err(e.into()),
        }
    }

    /// Start another attempt of a rolled-back or failed job, reusing its
    /// snapshot and slot when they still exist.
    pub async fn retry(&self, job_id: &str) -> Result<MigrationJob> {
        let lease = self.leases.acquire(job_id).await?;
        let result = async {
            if let Some(live) = self.jobs.try_load(job_id).await? {
                if !live.state.is_terminal() {
                    return Err(MigrationError::InvalidState {
                        job_id: job_id.to_string(),
                        state: live.state,
                        operation: "retry",
                    });
                }
            }
            let previous = self.jobs.load(job_id).await?;
            let retryable = match previous.state {
                JobState::RolledBack => true,
                JobState::Failed => !previous.requires_operator,
                _ => false,
            };
            if !retryable {
                return Err(MigrationError::InvalidState {
                    job_id: job_id.to_string(),
                    state: previous.state,
                    operation: "retry",
                });
            }

            let next = previous.successor();
            self.jobs.create(&next).await?;
            info!(job_id, attempt = next.attempt, "retrying job");
            self.drive_leased(job_id, &lease).await
        }
        .await;
        release(lease).await;
        result
    }

    /// Latest record plus lease and endpoint state.
    pub async fn status(&self, job_id: &str) -> Result<JobStatus> {
        let (job, archived) = match self.jobs.try_load(job_id).await? {
            Some(job) => (job, false),
            None => (self.jobs.load(job_id).await?, true),
        };
        Ok(JobStatus {
            lease: self.leases.holder(job_id).await?,
            primary_write: self.endpoints.connection(EndpointRole::PrimaryWrite),
            cancel_requested: self.jobs.cancel_requested(job_id).await,
            archived,
            job,
        })
    }

    /// Latest record of every known job.
    pub async fn list(&self) -> Result<Vec<MigrationJob>> {
        Ok(self.jobs.known_jobs().await?.into_values().collect())
    }

    /// Tear down orphaned slots.
    pub async fn sweep_orphans(&self) -> SweepReport {
        let report = replication::sweep(&self.replication, &self.jobs).await;
        info!(
            inspected = report.inspected.len(),
            torn_down = report.torn_down.len(),
            skipped = report.skipped.len(),
            errors = report.errors.len(),
            "orphaned slot sweep finished"
        );
        report
    }

    /// Sweep orphaned slots, then drive every unfinished job nobody holds.
    pub async fn reconcile(&self, resume: bool) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            sweep: self.sweep_orphans().await,
            ..Default::default()
        };
        if !resume {
            return Ok(report);
        }
        for job in self.jobs.list().await? {
            if job.state.is_terminal() {
                continue;
            }
            let id = job.spec.id;
            match self.drive(&id).await {
                Ok(job) => report.resumed.push((id, job.state)),
                Err(MigrationError::Lease(LeaseError::Held { .. })) => report.busy.push(id),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "resuming job failed");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Refuse a failover drill against anything but a finished migration
    /// target.
    pub async fn check_failover_allowed(&self, target: &str) -> Result<()> {
        let known = self.jobs.known_jobs().await?;
        if let Some(busy) = known.values().find(|j| {
            !j.state.is_terminal() && (j.spec.source == target || j.spec.target == target)
        }) {
            return Err(FailoverError::Refused(format!(
                "job '{}' is {} on '{target}'",
                busy.spec.id, busy.state
            ))
            .into());
        }
        let migrated = known
            .values()
            .any(|j| j.state == JobState::Completed && j.spec.target == target);
        if !migrated {
            return Err(FailoverError::Refused(format!(
                "no completed migration targets '{target}'"
            ))
            .into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    async fn drive_leased(&self, job_id: &str, lease: &JobLease) -> Result<MigrationJob> {
        let mut job = self.load_live(job_id).await?;
        loop {
            if !lease.is_valid() {
                return Err(MigrationError::LeaseLost(job_id.to_string()));
            }
            debug!(job_id, state = %job.state, "driving job");
            match job.state {
                JobState::Initiated => self.step_export(&mut job).await?,
                JobState::SnapshotExported => self.step_establish(&mut job).await?,
                JobState::ReplicationEstablished => {
                    self.commit(&mut job, JobState::Syncing, "lag monitoring started")
                        .await?
                }
                JobState::Syncing => self.step_sync(&mut job, lease).await?,
                JobState::Synced => {
                    if self.take_cancel(&mut job).await? {
                        continue;
                    }
                    if !self.config.auto_cutover {
                        return Ok(job);
                    }
                    self.step_cutover(&mut job, lease).await?;
                }
                JobState::CutoverInProgress => self.resume_cutover(&mut job, lease).await?,
                JobState::Completed | JobState::RolledBack | JobState::Failed => return Ok(job),
            }
        }
    }

    async fn step_export(&self, job: &mut MigrationJob) -> Result<()> {
        if let Some(snapshot) = job.snapshot.clone() {
            match self
                .replication
                .slot_exists(&job.spec.source, &snapshot.slot)
                .await
            {
                Ok(true) => {
                    let reason = format!("reusing retained snapshot {}", snapshot.key);
                    return self.commit(job, JobState::SnapshotExported, reason).await;
                }
                Ok(false) => {
                    info!(job_id = job.id(), slot = %snapshot.slot, "retained slot is gone, exporting again");
                    if job.replication.take().is_some() {
                        self.teardown_quietly(job).await;
                    }
                    job.snapshot = None;
                }
                Err(e) => return Err(self.halt(job, e.into()).await),
            }
        }

        let backoff = self.replication.config().backoff();
        let attempts = self.config.export_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.exporter.export(&job.spec).await {
                Ok(handle) => {
                    let reason = format!(
                        "snapshot {} exported at {} ({} bytes)",
                        handle.key, handle.consistent_lsn, handle.bytes
                    );
                    job.snapshot = Some(handle);
                    return self.commit(job, JobState::SnapshotExported, reason).await;
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        job_id = job.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "snapshot export failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.teardown_quietly(job).await;
                    return Err(self.fail(job, e.into()).await);
                }
            }
        }
    }

    async fn step_establish(&self, job: &mut MigrationJob) -> Result<()> {
        match self.replication.establish(job).await {
            Ok(handle) => {
                let reason = format!(
                    "subscription {} streaming from {}",
                    handle.subscription, handle.start_lsn
                );
                job.replication = Some(handle);
                self.commit(job, JobState::ReplicationEstablished, reason).await
            }
            Err(e) => {
                self.teardown_quietly(job).await;
                Err(self.fail(job, e.into()).await)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Record keeping
    // -----------------------------------------------------------------------

    async fn load_live(&self, job_id: &str) -> Result<MigrationJob> {
        match self.jobs.try_load(job_id).await? {
            Some(job) => Ok(job),
            None => {
                let archived = self.jobs.load(job_id).await?;
                Err(MigrationError::InvalidState {
                    job_id: job_id.to_string(),
                    state: archived.state,
                    operation: "drive",
                })
            }
        }
    }

    /// Commit a transition: persist, log, notify, archive if terminal.
    async fn commit(
        &self,
        job: &mut MigrationJob,
        to: JobState,
        reason: impl Into<String>,
    ) -> Result<()> {
        let from = job.state;
        let reason = reason.into();
        job.transition(to, reason.clone())?;
        self.jobs.save(job).await?;
        metrics::record_job_transition(from, to);
        info!(
            job_id = job.id(),
            attempt = job.attempt,
            from = %from,
            to = %to,
            reason = %reason,
            "state transition"
        );
        self.notifier.notify(TransitionEvent {
            job_id: job.spec.id.clone(),
            attempt: job.attempt,
            from,
            to,
            reason,
            at: job.updated_at,
        });
        if to.is_terminal() {
            self.jobs.archive(job).await?;
        }
        Ok(())
    }

    fn record(&self, job: &mut MigrationJob, err: &MigrationError) -> BTreeMap<String, String> {
        let context = context(job);
        job.record_error(ErrorRecord {
            class: err.class(),
            state: job.state,
            message: err.to_string(),
            context: context.clone(),
            at: Utc::now(),
        });
        context
    }

    /// Record `err` and stop without changing state.
    async fn halt(&self, job: &mut MigrationJob, err: MigrationError) -> MigrationError {
        let state = job.state;
        let context = self.record(job, &err);
        warn!(job_id = job.id(), state = %state, class = %err.class(), error = %err, "job halted");
        if let Err(e) = self.jobs.save(job).await {
            warn!(job_id = job.id(), error = %e, "could not persist halted job");
        }
        err.for_job(job.id(), state, context)
    }

    /// Record `err` and move the job to `Failed`.
    async fn fail(&self, job: &mut MigrationJob, err: MigrationError) -> MigrationError {
        let state = job.state;
        let context = self.record(job, &err);
        let reason = format!("{} error: {err}", err.class());
        if let Err(e) = self.commit(job, JobState::Failed, reason).await {
            warn!(job_id = job.id(), error = %e, "could not persist failed job");
        }
        err.for_job(job.id(), state, context)
    }

    /// Honour a pending cancel. Returns whether the job was cancelled.
    async fn take_cancel(&self, job: &mut MigrationJob) -> Result<bool> {
        if !self.jobs.cancel_requested(job.id()).await {
            return Ok(false);
        }
        if !job.state.is_cancellable() {
            warn!(job_id = job.id(), state = %job.state, "ignoring cancel outside Syncing/Synced");
            self.jobs.clear_cancel(job.id()).await?;
            return Ok(false);
        }
        self.teardown_quietly(job).await;
        self.commit(job, JobState::Failed, "cancelled by operator").await?;
        self.jobs.clear_cancel(job.id()).await?;
        Ok(true)
    }

    /// Roll back and commit `RolledBack`; a failed rollback leaves the job
    /// `Failed` for an operator.
    async fn roll_back(&self, job: &mut MigrationJob, cause: &str) -> Result<()> {
        match self.rollback.rollback(job).await {
            Ok(outcome) => {
                let reason = format!("{cause}; primary-write on {}", outcome.primary);
                self.commit(job, JobState::RolledBack, reason).await
            }
            Err(e) => {
                job.requires_operator = true;
                Err(self.fail(job, e.into()).await)
            }
        }
    }

    async fn teardown_quietly(&self, job: &MigrationJob) {
        let names = self.replication.names_for(job.id());
        match self
            .replication
            .teardown_names(&job.spec.source, Some(job.spec.target.as_str()), &names)
            .await
        {
            Ok(report) => debug!(job_id = job.id(), ?report, "replication torn down"),
            Err(e) => warn!(
                job_id = job.id(),
                slot = %names.slot,
                error = %e,
                "teardown failed; the next sweep will retry"
            ),
        }
    }
}

/// LSN, lag, table and cutover facts for error records.
fn context(job: &MigrationJob) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    context.insert("attempt".to_string(), job.attempt.to_string());
    if let Some(ref handle) = job.replication {
        context.insert("slot".to_string(), handle.slot.clone());
        if let Some(lsn) = handle.last_confirmed_lsn {
            context.insert("lsn".to_string(), lsn.to_string());
        }
        if let Some(lag) = handle.last_lag_bytes {
            context.insert("lag_bytes".to_string(), lag.to_string());
        }
    }
    if let Some(check) = job.latest_check() {
        let failing = check.failing_tables();
        if !failing.is_empty() {
            context.insert("table".to_string(), failing.join(","));
        }
    }
    if let Some(ref cutover) = job.cutover {
        if let Some(step) = cutover.last_step {
            context.insert("cutover_step".to_string(), format!("{step:?}"));
        }
        if let Some(lsn) = cutover.freeze_lsn {
            context.insert("freeze_lsn".to_string(), lsn.to_string());
        }
    }
    context
}

async fn release(lease: JobLease) {
    let job_id = lease.job_id().to_string();
    if let Err(e) = lease.release().await {
        warn!(job_id = %job_id, error = %e, "could not release lease");
    }
}

/// Await `fut` for at most `budget`.
async fn bounded<T, E, F>(budget: Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, E>>,
    E: Into<MigrationError>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(MigrationError::Timeout(format!(
            "{what} not received within {}ms",
            budget.as_millis()
        ))),
    }
}
