//! Error taxonomy
//!
//! Every component has its own error enum. They fold into [`MigrationError`],
//! whose [`class`](MigrationError::class) decides what the coordinator does
//! with a failure:
//!
//! | Class        | Coordinator reaction                          | Exit code |
//! |--------------|-----------------------------------------------|-----------|
//! | `Transient`  | retried at component level, then surfaced     | 75        |
//! | `Validation` | surfaced; the job halts where it is            | 65        |
//! | `Fatal`      | rollback or fail; automation may stop          | 70        |
//!
//! Configuration problems exit with 78.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterApiError;
use crate::config::ConfigError;
use crate::failover::FailoverError;
use crate::hooks::HookError;
use crate::job::{InvalidTransition, JobState, JobStoreError, LeaseError, SpecError};
use crate::registry::RegistryError;
use crate::replication::ReplicationError;
use crate::rollback::RollbackError;
use crate::snapshot::ExportError;
use crate::store::StoreError;
use crate::validator::ValidatorError;

/// Exit code for transient failures (`EX_TEMPFAIL`).
pub const EXIT_TRANSIENT: i32 = 75;
/// Exit code for validation failures (`EX_DATAERR`).
pub const EXIT_VALIDATION: i32 = 65;
/// Exit code for fatal failures (`EX_SOFTWARE`).
pub const EXIT_FATAL: i32 = 70;
/// Exit code for configuration errors (`EX_CONFIG`).
pub const EXIT_CONFIG: i32 = 78;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// May clear up by itself; retried with backoff.
    Transient,
    /// Data or precondition problem; the job halts in place.
    Validation,
    /// Unrecoverable for this attempt.
    Fatal,
}

impl ErrorClass {
    /// Process exit code for the class.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Transient => EXIT_TRANSIENT,
            Self::Validation => EXIT_VALIDATION,
            Self::Fatal => EXIT_FATAL,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Validation => write!(f, "validation"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Crate-level error.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Job spec error
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// Connection or endpoint registry error
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Backup store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Snapshot export error
    #[error(transparent)]
    Export(#[from] ExportError),

    /// Replication error
    #[error(transparent)]
    Replication(#[from] ReplicationError),

    /// Validator error
    #[error(transparent)]
    Validator(#[from] ValidatorError),

    /// Rollback error
    #[error(transparent)]
    Rollback(#[from] RollbackError),

    /// Freeze hook error
    #[error(transparent)]
    Hook(#[from] HookError),

    /// Cluster API error
    #[error(transparent)]
    Cluster(#[from] ClusterApiError),

    /// Failover drill error
    #[error(transparent)]
    Failover(#[from] FailoverError),

    /// Job store error
    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    /// Lease error
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Illegal state transition
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    /// The job is not in a state that allows the operation.
    #[error("cannot {operation} job '{job_id}' in state {state}")]
    InvalidState {
        /// Job id.
        job_id: String,
        /// Current state.
        state: JobState,
        /// Requested operation.
        operation: &'static str,
    },

    /// A consistency or lag precondition did not hold.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Replication did not converge in time.
    #[error("replication did not converge within {secs}s")]
    NotConverged {
        /// Budget that ran out.
        secs: u64,
    },

    /// The job lease was taken over while the job was being driven.
    #[error("lease on job '{0}' was lost")]
    LeaseLost(String),

    /// The job record is missing data its state requires.
    #[error("job '{job_id}' record is inconsistent: {reason}")]
    Corrupt {
        /// Job id.
        job_id: String,
        /// What is missing.
        reason: String,
    },

    /// A failure tied to a job and the state it happened in.
    #[error(transparent)]
    Job(#[from] Box<JobError>),
}

impl MigrationError {
    /// Taxonomy class.
    pub fn class(&self) -> ErrorClass {
        use ErrorClass::*;
        match self {
            Self::Config(_) | Self::Spec(_) => Validation,
            Self::Registry(e) if e.is_transient() => Transient,
            Self::Store(e) if e.is_transient() => Transient,
            Self::Export(e) if e.is_retryable() => Transient,
            Self::Replication(e) if e.is_transient() => Transient,
            Self::Validator(_) => Transient,
            Self::Cluster(ClusterApiError::Request(_)) => Transient,
            Self::JobStore(JobStoreError::Persist(_)) => Fatal,
            Self::JobStore(_) => Validation,
            Self::Lease(LeaseError::Held { .. }) => Transient,
            Self::Transition(_) | Self::InvalidState { .. } | Self::Validation(_) => Validation,
            Self::Timeout(_) | Self::LeaseLost(_) => Transient,
            Self::Job(e) => e.source.class(),
            _ => Fatal,
        }
    }

    /// Process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Spec(_) => EXIT_CONFIG,
            Self::Job(e) => e.source.exit_code(),
            other => other.class().exit_code(),
        }
    }

    /// Attach job identity, state and context.
    pub fn for_job(
        self,
        job_id: impl Into<String>,
        state: JobState,
        context: BTreeMap<String, String>,
    ) -> Self {
        match self {
            Self::Job(e) => Self::Job(e),
            source => Self::Job(Box::new(JobError {
                job_id: job_id.into(),
                state,
                context,
                source,
            })),
        }
    }
}

/// An error that reached the coordinator while driving a job.
#[derive(Debug, thiserror::Error)]
pub struct JobError {
    /// Job id.
    pub job_id: String,
    /// State at failure.
    pub state: JobState,
    /// LSN, table, lag and similar facts.
    pub context: BTreeMap<String, String>,
    /// Underlying failure.
    #[source]
    pub source: MigrationError,
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job '{}' failed in {}: {}", self.job_id, self.state, self.source)?;
        if !self.context.is_empty() {
            let facts: Vec<String> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " ({})", facts.join(", "))?;
        }
        Ok(())
    }
}

/// Result alias used by the coordinator.
pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::db::DbError;

    #[test]
    fn test_classes() {
        let transient = MigrationError::Export(ExportError::SourceUnreachable("refused".into()));
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert_eq!(transient.exit_code(), 75);

        let fatal = MigrationError::Replication(ReplicationError::SlotMissing {
            slot: "pgshift_a".into(),
            source_name: "legacy".into(),
        });
        assert_eq!(fatal.class(), ErrorClass::Fatal);
        assert_eq!(fatal.exit_code(), 70);

        let validation = MigrationError::Validation("checksum mismatch on users".into());
        assert_eq!(validation.exit_code(), 65);

        let config = MigrationError::Config(ConfigError::Invalid("x".into()));
        assert_eq!(config.exit_code(), 78);
    }

    #[test]
    fn test_job_error_keeps_class_and_context() {
        let inner = MigrationError::Replication(ReplicationError::Source(DbError::Timeout(
            "slot_position".into(),
        )));
        let mut context = BTreeMap::new();
        context.insert("lsn".to_string(), "0/1000".to_string());
        let err = inner.for_job("orders", JobState::Syncing, context);
        assert_eq!(err.class(), ErrorClass::Transient);
        let text = err.to_string();
        assert!(text.contains("orders"), "{text}");
        assert!(text.contains("Syncing"), "{text}");
        assert!(text.contains("lsn=0/1000"), "{text}");

        // wrapping twice keeps the first identity
        let again = err.for_job("other", JobState::Failed, BTreeMap::new());
        assert!(again.to_string().contains("orders"));
    }
}
