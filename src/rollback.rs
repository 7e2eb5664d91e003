//! Rollback Manager
//!
//! Reverses a partially completed cutover: `primary-write` goes back to the
//! source (after the source proves it is live) and application writes are
//! unfrozen. The subscription stays attached, so a retry resumes from the
//! retained slot without exporting again.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::hooks::{FreezeHook, HookError};
use crate::job::MigrationJob;
use crate::registry::{ConnectionRegistry, EndpointRegistry, EndpointRole, RegistryError, RepointOutcome};

/// Rollback failures. Any of these leaves the job for an operator.
#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    /// The source did not answer, so writes cannot be sent back to it.
    #[error("source '{connection}' is not live: {source}")]
    SourceNotLive {
        /// Source connection.
        connection: String,
        /// Health failure.
        #[source]
        source: RegistryError,
    },

    /// The endpoint registry refused the repoint.
    #[error("could not restore primary-write: {0}")]
    Repoint(#[source] RegistryError),

    /// The application did not acknowledge the unfreeze.
    #[error("unfreeze failed: {0}")]
    Unfreeze(#[source] HookError),
}

/// What a rollback did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// `primary-write` was moved back to the source.
    pub restored_primary: bool,
    /// Connection `primary-write` points at afterwards.
    pub primary: String,
    /// The unfreeze hook was called and acknowledged.
    pub unfrozen: bool,
}

/// Reverses cutovers.
pub struct RollbackManager {
    registry: Arc<ConnectionRegistry>,
    endpoints: Arc<EndpointRegistry>,
    hook: Arc<dyn FreezeHook>,
    unfreeze_timeout: Duration,
}

impl RollbackManager {
    /// New manager.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        endpoints: Arc<EndpointRegistry>,
        hook: Arc<dyn FreezeHook>,
        unfreeze_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            endpoints,
            hook,
            unfreeze_timeout,
        }
    }

    /// Put writes back on the job's source. Running it again after success
    /// changes nothing.
    pub async fn rollback(&self, job: &MigrationJob) -> Result<RollbackOutcome, RollbackError> {
        let source = &job.spec.source;
        let mut restored_primary = false;

        if self.endpoints.connection(EndpointRole::PrimaryWrite).as_deref() != Some(source) {
            let proof = self.registry.confirm_live(source).await.map_err(|e| {
                RollbackError::SourceNotLive {
                    connection: source.clone(),
                    source: e,
                }
            })?;
            let outcome = self
                .endpoints
                .repoint(EndpointRole::PrimaryWrite, &proof)
                .await
                .map_err(RollbackError::Repoint)?;
            restored_primary = matches!(outcome, RepointOutcome::Changed { .. });
        }

        // Without a started cutover nothing was ever frozen.
        let mut unfrozen = false;
        if job.cutover.is_some() {
            match tokio::time::timeout(self.unfreeze_timeout, self.hook.unfreeze(job.id())).await {
                Ok(Ok(())) => unfrozen = true,
                Ok(Err(e)) => return Err(RollbackError::Unfreeze(e)),
                Err(_) => {
                    warn!(job_id = job.id(), "unfreeze timed out during rollback");
                    return Err(RollbackError::Unfreeze(HookError::Timeout {
                        action: "unfreeze",
                        timeout_ms: self.unfreeze_timeout.as_millis() as u64,
                    }));
                }
            }
        }

        info!(
            job_id = job.id(),
            restored_primary,
            unfrozen,
            primary = %source,
            "rollback finished"
        );
        Ok(RollbackOutcome {
            restored_primary,
            primary: source.clone(),
            unfrozen,
        })
    }
}
