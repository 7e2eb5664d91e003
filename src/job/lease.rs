//! Job leases
//!
//! Only one coordinator may drive a job at a time. A lease is a small file
//! `leases/<job-id>.lease` naming its holder and an expiry; the holder
//! renews it in the background, and a crashed holder's lease can be taken
//! over once it expires. Within one process a guard set additionally stops
//! two tasks from driving the same job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persist::{self, PersistError};

const LEASES_DIR: &str = "leases";

/// Lease errors.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Another holder owns an unexpired lease.
    #[error("job '{job_id}' is being driven by {owner} until {expires_at}")]
    Held {
        /// Job id.
        job_id: String,
        /// Current holder.
        owner: String,
        /// Expiry of the current lease.
        expires_at: DateTime<Utc>,
    },

    /// Lease file access failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// On-disk lease content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Holder identity.
    pub owner: String,
    /// Job id.
    pub job_id: String,
    /// First acquisition by this holder.
    pub acquired_at: DateTime<Utc>,
    /// Lease is void after this instant unless renewed.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Hands out per-job leases for one process identity.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    dir: PathBuf,
    owner: String,
    ttl: Duration,
    held: Arc<DashSet<String>>,
}

impl LeaseManager {
    /// Manager storing leases under `state_dir` with the given TTL.
    pub fn new(state_dir: &Path, ttl: Duration) -> Self {
        Self {
            dir: state_dir.join(LEASES_DIR),
            owner: format!("pid{}-{}", std::process::id(), uuid::Uuid::new_v4().simple()),
            ttl: ttl.max(Duration::from_secs(1)),
            held: Arc::new(DashSet::new()),
        }
    }

    /// This manager's holder identity.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.lease"))
    }

    fn record(&self, job_id: &str, acquired_at: DateTime<Utc>) -> LeaseRecord {
        let ttl = chrono::Duration::milliseconds(self.ttl.as_millis() as i64);
        LeaseRecord {
            owner: self.owner.clone(),
            job_id: job_id.to_string(),
            acquired_at,
            expires_at: Utc::now() + ttl,
        }
    }

    /// Current lease holder, if the lease is unexpired.
    pub async fn holder(&self, job_id: &str) -> Result<Option<LeaseRecord>, LeaseError> {
        let record: Option<LeaseRecord> = persist::read_json(&self.path(job_id)).await?;
        Ok(record.filter(|r| !r.is_expired()))
    }

    /// Acquire the lease for `job_id` and start renewing it.
    pub async fn acquire(&self, job_id: &str) -> Result<JobLease, LeaseError> {
        if !self.held.insert(job_id.to_string()) {
            return Err(LeaseError::Held {
                job_id: job_id.to_string(),
                owner: self.owner.clone(),
                expires_at: Utc::now(),
            });
        }
        match self.claim_file(job_id).await {
            Ok(()) => {}
            Err(e) => {
                self.held.remove(job_id);
                return Err(e);
            }
        }

        let lost = Arc::new(AtomicBool::new(false));
        let renewer = tokio::spawn(renew_loop(
            self.clone(),
            job_id.to_string(),
            Arc::clone(&lost),
        ));
        debug!(job_id, owner = %self.owner, "lease acquired");
        Ok(JobLease {
            manager: self.clone(),
            job_id: job_id.to_string(),
            lost,
            renewer: Some(renewer),
        })
    }

    async fn claim_file(&self, job_id: &str) -> Result<(), LeaseError> {
        let path = self.path(job_id);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(PersistError::from)?;

        // Exclusive create settles races between processes starting together.
        let fresh = self.record(job_id, Utc::now());
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                let body = serde_json::to_vec_pretty(&fresh).map_err(|e| {
                    PersistError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                file.write_all(&body).await.map_err(PersistError::from)?;
                file.sync_all().await.map_err(PersistError::from)?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(PersistError::from(e).into()),
        }

        let existing: Option<LeaseRecord> = persist::read_json(&path).await.ok().flatten();
        match existing {
            Some(record) if !record.is_expired() && record.owner != self.owner => {
                Err(LeaseError::Held {
                    job_id: job_id.to_string(),
                    owner: record.owner,
                    expires_at: record.expires_at,
                })
            }
            Some(record) => {
                if record.owner != self.owner {
                    warn!(job_id, previous = %record.owner, "taking over expired lease");
                }
                let acquired_at = if record.owner == self.owner {
                    record.acquired_at
                } else {
                    Utc::now()
                };
                persist::write_json(&path, &self.record(job_id, acquired_at)).await?;
                Ok(())
            }
            None => {
                persist::write_json(&path, &fresh).await?;
                Ok(())
            }
        }
    }
}

async fn renew_loop(manager: LeaseManager, job_id: String, lost: Arc<AtomicBool>) {
    let period = manager.ttl / 3;
    let path = manager.path(&job_id);
    loop {
        tokio::time::sleep(period).await;
        let current: Option<LeaseRecord> = match persist::read_json(&path).await {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "lease renewal failed, will retry");
                continue;
            }
        };
        match current {
            Some(r) if r.owner == manager.owner => {
                let next = manager.record(&job_id, r.acquired_at);
                if let Err(e) = persist::write_json(&path, &next).await {
                    warn!(job_id = %job_id, error = %e, "lease renewal failed, will retry");
                }
            }
            _ => {
                warn!(job_id = %job_id, "lease lost to another holder");
                lost.store(true, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// A held job lease. Dropping it stops renewal and frees the in-process
/// guard; the file then lapses after its TTL unless [`JobLease::release`]
/// removed it first.
#[derive(Debug)]
pub struct JobLease {
    manager: LeaseManager,
    job_id: String,
    lost: Arc<AtomicBool>,
    renewer: Option<JoinHandle<()>>,
}

impl JobLease {
    /// Job the lease covers.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// False once another holder has taken the lease over.
    pub fn is_valid(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Give the lease up now.
    pub async fn release(mut self) -> Result<(), LeaseError> {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        let path = self.manager.path(&self.job_id);
        let current: Option<LeaseRecord> = persist::read_json(&path).await.ok().flatten();
        if current.is_some_and(|r| r.owner == self.manager.owner) {
            persist::remove(&path).await?;
        }
        info!(job_id = %self.job_id, "lease released");
        Ok(())
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        self.manager.held.remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn test_in_process_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        let leases = LeaseManager::new(dir.path(), Duration::from_secs(30));
        let lease = leases.acquire("job").await.unwrap();
        assert!(matches!(
            leases.acquire("job").await,
            Err(LeaseError::Held { .. })
        ));
        leases.acquire("other").await.unwrap();
        drop(lease);
        leases.acquire("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_cross_process_exclusion_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let a = LeaseManager::new(dir.path(), Duration::from_secs(30));
        let b = LeaseManager::new(dir.path(), Duration::from_secs(30));

        let lease = a.acquire("job").await.unwrap();
        let err = b.acquire("job").await.unwrap_err();
        assert!(matches!(err, LeaseError::Held { ref owner, .. } if owner == a.owner()));
        assert_eq!(b.holder("job").await.unwrap().unwrap().owner, a.owner());

        lease.release().await.unwrap();
        assert!(b.holder("job").await.unwrap().is_none());
        b.acquire("job").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let a = LeaseManager::new(dir.path(), Duration::from_secs(30));
        let b = LeaseManager::new(dir.path(), Duration::from_secs(30));

        let stale = LeaseRecord {
            owner: a.owner().to_string(),
            job_id: "job".into(),
            acquired_at: Utc::now() - chrono::Duration::minutes(5),
            expires_at: Utc::now() - chrono::Duration::minutes(1),
        };
        persist::write_json(&dir.path().join("leases/job.lease"), &stale)
            .await
            .unwrap();

        let lease = b.acquire("job").await.unwrap();
        assert!(lease.is_valid());
        assert_eq!(b.holder("job").await.unwrap().unwrap().owner, b.owner());
    }
}
