//! Migration Jobs
//!
//! A [`JobSpec`] is what the operator submits (a TOML file); a
//! [`MigrationJob`] is the persisted record the coordinator drives through
//! the state machine:
//!
//! ```text
//! Initiated -> SnapshotExported -> ReplicationEstablished -> Syncing
//!           -> Synced -> CutoverInProgress -> Completed
//! ```
//!
//! `RolledBack` and `Failed` are reachable from every non-terminal state.
//! Terminal records are immutable.

pub mod lease;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Lsn;
use crate::error::ErrorClass;
use crate::replication::ReplicationSlotHandle;
use crate::snapshot::SnapshotHandle;
use crate::validator::ConsistencyCheckResult;

pub use lease::{JobLease, LeaseError, LeaseManager};
pub use store::{JobStore, JobStoreError};

/// Validator results kept on a job record.
pub const MAX_RETAINED_CHECKS: usize = 64;

// ---------------------------------------------------------------------------
// Job spec
// ---------------------------------------------------------------------------

/// How much drift the validator tolerates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumPolicy {
    /// Allowed absolute row-count difference per table.
    pub row_count_tolerance: u64,
    /// Whether checksums must match exactly.
    pub require_checksum_match: bool,
}

impl Default for ChecksumPolicy {
    fn default() -> Self {
        Self {
            row_count_tolerance: 0,
            require_checksum_match: true,
        }
    }
}

/// Operator-submitted description of a migration.
///
/// ```toml
/// id = "orders-2024"
/// source = "legacy"
/// target = "cluster"
/// tables = ["public.users", "public.orders"]
/// lag_tolerance_ms = 1000
///
/// [checksum]
/// row_count_tolerance = 0
/// require_checksum_match = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique job id.
    pub id: String,
    /// Source connection name.
    pub source: String,
    /// Target connection name.
    pub target: String,
    /// Tables to migrate.
    pub tables: Vec<String>,
    /// Lag considered "in sync".
    #[serde(default = "default_lag_tolerance_ms")]
    pub lag_tolerance_ms: u64,
    /// Validation tolerance.
    #[serde(default)]
    pub checksum: ChecksumPolicy,
}

fn default_lag_tolerance_ms() -> u64 {
    1_000
}

/// Problems with a job spec.
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// The file could not be read.
    #[error("failed to read job spec {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// I/O error.
        #[source]
        source: std::io::Error,
    },
    /// TOML did not match the schema.
    #[error("failed to parse job spec: {0}")]
    Parse(String),
    /// Parsed, but unusable.
    #[error("invalid job spec: {0}")]
    Invalid(String),
}

impl JobSpec {
    /// Load a job spec from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, SpecError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_str(&contents)
    }

    /// Parse and validate a job spec.
    pub fn parse_str(contents: &str) -> Result<Self, SpecError> {
        let spec: Self = toml::from_str(contents).map_err(|e| SpecError::Parse(e.to_string()))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Check ids and table names.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.id.is_empty()
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SpecError::Invalid(format!(
                "job id '{}' must be non-empty [A-Za-z0-9_-]",
                self.id
            )));
        }
        if self.source == self.target {
            return Err(SpecError::Invalid(
                "source and target must be different connections".into(),
            ));
        }
        if self.tables.is_empty() {
            return Err(SpecError::Invalid("at least one table is required".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for table in &self.tables {
            crate::db::quote_table(table)
                .map_err(|_| SpecError::Invalid(format!("bad table name '{table}'")))?;
            if !seen.insert(table) {
                return Err(SpecError::Invalid(format!("table '{table}' listed twice")));
            }
        }
        if self.lag_tolerance_ms == 0 {
            return Err(SpecError::Invalid("lag_tolerance_ms cannot be 0".into()));
        }
        Ok(())
    }

    /// Lag tolerance as a duration.
    pub fn lag_tolerance(&self) -> Duration {
        Duration::from_millis(self.lag_tolerance_ms)
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Accepted, nothing done yet.
    Initiated,
    /// Snapshot stored; slot anchored.
    SnapshotExported,
    /// Snapshot imported and subscription running.
    ReplicationEstablished,
    /// Waiting for lag to converge.
    Syncing,
    /// Lag within tolerance for the convergence window.
    Synced,
    /// Cutover sequence running.
    CutoverInProgress,
    /// Writes moved to the target.
    Completed,
    /// Cutover reversed; writes on the source.
    RolledBack,
    /// Stopped; see the last error.
    Failed,
}

impl JobState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack | Self::Failed)
    }

    /// Next state on the happy path.
    pub fn successor(self) -> Option<JobState> {
        match self {
            Self::Initiated => Some(Self::SnapshotExported),
            Self::SnapshotExported => Some(Self::ReplicationEstablished),
            Self::ReplicationEstablished => Some(Self::Syncing),
            Self::Syncing => Some(Self::Synced),
            Self::Synced => Some(Self::CutoverInProgress),
            Self::CutoverInProgress => Some(Self::Completed),
            Self::Completed | Self::RolledBack | Self::Failed => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match to {
            Self::RolledBack | Self::Failed => true,
            _ => self.successor() == Some(to),
        }
    }

    /// Whether an operator cancel is honoured.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Syncing | Self::Synced)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A rejected state change.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal transition {from} -> {to} for job {job_id}")]
pub struct InvalidTransition {
    /// Job id.
    pub job_id: String,
    /// Current state.
    pub from: JobState,
    /// Requested state.
    pub to: JobState,
}

/// One entry of the transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State left.
    pub from: JobState,
    /// State entered.
    pub to: JobState,
    /// When.
    pub at: DateTime<Utc>,
    /// Why.
    pub reason: String,
}

/// Cutover steps, in execution order. Each is persisted once done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverStep {
    /// Final consistency check passed.
    FinalCheckPassed,
    /// Freeze hook acknowledged.
    Frozen,
    /// Target confirmed the freeze position.
    Drained,
    /// `primary-write` points at the target.
    Repointed,
    /// Unfreeze hook acknowledged.
    Unfrozen,
    /// Target accepted a probe write.
    Probed,
}

/// Persisted progress through the cutover sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoverProgress {
    /// When the sequence began.
    pub started_at: DateTime<Utc>,
    /// Last completed step.
    pub last_step: Option<CutoverStep>,
    /// Source position when writes were frozen.
    pub freeze_lsn: Option<Lsn>,
}

impl CutoverProgress {
    /// Progress for a sequence starting now.
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            last_step: None,
            freeze_lsn: None,
        }
    }

    /// Whether `step` has completed.
    pub fn reached(&self, step: CutoverStep) -> bool {
        self.last_step.is_some_and(|s| s >= step)
    }
}

/// The last error that reached the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Taxonomy class.
    pub class: ErrorClass,
    /// State the job was in.
    pub state: JobState,
    /// Rendered error chain.
    pub message: String,
    /// LSN, table, lag and similar facts.
    pub context: BTreeMap<String, String>,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// Persisted migration job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    /// What the operator asked for.
    pub spec: JobSpec,
    /// Current state.
    pub state: JobState,
    /// Attempt counter; bumped by `retry`.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Transition log.
    pub transitions: Vec<Transition>,
    /// Exported snapshot, once taken.
    pub snapshot: Option<SnapshotHandle>,
    /// Replication channel, once established.
    pub replication: Option<ReplicationSlotHandle>,
    /// Validator history, oldest first.
    pub checks: Vec<ConsistencyCheckResult>,
    /// Cutover progress, once started.
    pub cutover: Option<CutoverProgress>,
    /// Last error that reached the coordinator.
    pub last_error: Option<ErrorRecord>,
    /// Set when automation must not touch the job again.
    pub requires_operator: bool,
}

fn first_attempt() -> u32 {
    1
}

impl MigrationJob {
    /// New job in `Initiated`.
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            spec,
            state: JobState::Initiated,
            attempt: 1,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
            snapshot: None,
            replication: None,
            checks: Vec::new(),
            cutover: None,
            last_error: None,
            requires_operator: false,
        }
    }

    /// Job id.
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Move to `to`, logging `reason`.
    pub fn transition(
        &mut self,
        to: JobState,
        reason: impl Into<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                job_id: self.spec.id.clone(),
                from: self.state,
                to,
            });
        }
        let now = Utc::now();
        self.transitions.push(Transition {
            from: self.state,
            to,
            at: now,
            reason: reason.into(),
        });
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Append a validator result, keeping the most recent
    /// [`MAX_RETAINED_CHECKS`].
    pub fn record_check(&mut self, result: ConsistencyCheckResult) {
        self.checks.push(result);
        if self.checks.len() > MAX_RETAINED_CHECKS {
            let excess = self.checks.len() - MAX_RETAINED_CHECKS;
            self.checks.drain(..excess);
        }
        self.updated_at = Utc::now();
    }

    /// Latest result taken while lag was at most `max_lag_bytes`.
    pub fn trusted_check(&self, max_lag_bytes: u64) -> Option<&ConsistencyCheckResult> {
        self.checks
            .iter()
            .rev()
            .find(|c| c.lag_bytes.is_some_and(|lag| lag <= max_lag_bytes))
    }

    /// Most recent validator result.
    pub fn latest_check(&self) -> Option<&ConsistencyCheckResult> {
        self.checks.last()
    }

    /// Record the error that stopped progress.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.last_error = Some(record);
        self.updated_at = Utc::now();
    }

    /// Mark a cutover step complete.
    pub fn complete_step(&mut self, step: CutoverStep) {
        if let Some(progress) = self.cutover.as_mut() {
            progress.last_step = Some(step);
            self.updated_at = Utc::now();
        }
    }

    /// Whether the given step has completed.
    pub fn step_reached(&self, step: CutoverStep) -> bool {
        self.cutover.as_ref().is_some_and(|c| c.reached(step))
    }

    /// Fresh record that reuses this job's snapshot and replication for
    /// another attempt. Only valid for `RolledBack` and non-operator
    /// `Failed` jobs.
    pub fn successor(&self) -> Self {
        let mut next = Self::new(self.spec.clone());
        next.attempt = self.attempt + 1;
        next.snapshot = self.snapshot.clone();
        next.replication = self.replication.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    const SPEC: &str = r#"
id = "orders-1"
source = "legacy"
target = "cluster"
tables = ["users", "public.orders"]
"#;

    #[test]
    fn test_parse_spec_defaults() {
        let spec = JobSpec::parse_str(SPEC).unwrap();
        assert_eq!(spec.lag_tolerance(), Duration::from_secs(1));
        assert!(spec.checksum.require_checksum_match);
        assert_eq!(spec.checksum.row_count_tolerance, 0);
    }

    #[test]
    fn test_spec_validation() {
        let bad_id = SPEC.replace("orders-1", "orders 1");
        assert!(matches!(JobSpec::parse_str(&bad_id), Err(SpecError::Invalid(_))));

        let same = SPEC.replace("\"cluster\"", "\"legacy\"");
        assert!(JobSpec::parse_str(&same).is_err());

        let dup = SPEC.replace("public.orders", "users");
        assert!(JobSpec::parse_str(&dup).is_err());

        let empty = SPEC.replace("[\"users\", \"public.orders\"]", "[]");
        assert!(JobSpec::parse_str(&empty).is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = MigrationJob::new(JobSpec::parse_str(SPEC).unwrap());
        let mut state = job.state;
        while let Some(next) = state.successor() {
            job.transition(next, "step").unwrap();
            state = next;
        }
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.transitions.len(), 6);
        assert!(job.transition(JobState::Failed, "late").is_err());
    }

    #[test]
    fn test_no_state_is_skipped() {
        let mut job = MigrationJob::new(JobSpec::parse_str(SPEC).unwrap());
        let err = job.transition(JobState::Syncing, "skip").unwrap_err();
        assert_eq!(err.from, JobState::Initiated);
        assert_eq!(job.state, JobState::Initiated);
        assert!(job.transitions.is_empty());
    }

    #[test]
    fn test_failure_reachable_from_non_terminal() {
        for state in [
            JobState::Initiated,
            JobState::Syncing,
            JobState::CutoverInProgress,
        ] {
            assert!(state.can_transition_to(JobState::Failed));
            assert!(state.can_transition_to(JobState::RolledBack));
        }
        assert!(!JobState::RolledBack.can_transition_to(JobState::Failed));
    }

    #[test]
    fn test_cancellable_states() {
        assert!(JobState::Syncing.is_cancellable());
        assert!(JobState::Synced.is_cancellable());
        assert!(!JobState::CutoverInProgress.is_cancellable());
        assert!(!JobState::Initiated.is_cancellable());
    }

    #[test]
    fn test_cutover_progress_ordering() {
        let mut progress = CutoverProgress::start();
        assert!(!progress.reached(CutoverStep::FinalCheckPassed));
        progress.last_step = Some(CutoverStep::Repointed);
        assert!(progress.reached(CutoverStep::Frozen));
        assert!(progress.reached(CutoverStep::Repointed));
        assert!(!progress.reached(CutoverStep::Probed));
    }

    #[test]
    fn test_cutover_progress_loads_records_with_retired_fields() {
        let json = r#"{
            "started_at": "2026-01-05T10:00:00Z",
            "last_step": "drained",
            "freeze_lsn": null,
            "previous_primary": "legacy"
        }"#;
        let progress: CutoverProgress = serde_json::from_str(json).unwrap();
        assert_eq!(progress.last_step, Some(CutoverStep::Drained));
        let saved = serde_json::to_string(&progress).unwrap();
        assert!(!saved.contains("previous_primary"));
    }
}
