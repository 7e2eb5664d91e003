//! Job record storage
//!
//! Layout under the state directory:
//!
//! ```text
//! jobs/<id>.json              live record
//! jobs/<id>.cancel            pending operator cancel
//! archive/<id>.<attempt>.json finished attempts
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};

use super::{JobState, MigrationJob};
use crate::persist::{self, PersistError};

const JOBS_DIR: &str = "jobs";
const ARCHIVE_DIR: &str = "archive";

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    /// No record with this id.
    #[error("job '{0}' not found")]
    NotFound(String),

    /// A live record already uses the id.
    #[error("job '{id}' already exists in state {state}")]
    AlreadyExists {
        /// Job id.
        id: String,
        /// Its current state.
        state: JobState,
    },

    /// Attempted to modify a terminal record.
    #[error("job '{id}' is {state} and can no longer change")]
    Immutable {
        /// Job id.
        id: String,
        /// Terminal state.
        state: JobState,
    },

    /// File access failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// File-backed job records.
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs: PathBuf,
    archive: PathBuf,
}

impl JobStore {
    /// Store rooted at `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            jobs: state_dir.join(JOBS_DIR),
            archive: state_dir.join(ARCHIVE_DIR),
        }
    }

    fn live_path(&self, id: &str) -> PathBuf {
        self.jobs.join(format!("{id}.json"))
    }

    fn cancel_path(&self, id: &str) -> PathBuf {
        self.jobs.join(format!("{id}.cancel"))
    }

    fn archive_path(&self, id: &str, attempt: u32) -> PathBuf {
        self.archive.join(format!("{id}.{attempt}.json"))
    }

    /// Persist a new job. Fails if a live record exists.
    pub async fn create(&self, job: &MigrationJob) -> Result<(), JobStoreError> {
        if let Some(existing) = self.try_load(job.id()).await? {
            return Err(JobStoreError::AlreadyExists {
                id: existing.spec.id,
                state: existing.state,
            });
        }
        persist::write_json(&self.live_path(job.id()), job).await?;
        info!(job_id = job.id(), attempt = job.attempt, "job created");
        Ok(())
    }

    /// Live record, if any.
    pub async fn try_load(&self, id: &str) -> Result<Option<MigrationJob>, JobStoreError> {
        Ok(persist::read_json(&self.live_path(id)).await?)
    }

    /// Live record, falling back to the newest archived attempt.
    pub async fn load(&self, id: &str) -> Result<MigrationJob, JobStoreError> {
        if let Some(job) = self.try_load(id).await? {
            return Ok(job);
        }
        self.load_archived(id)
            .await?
            .ok_or_else(|| JobStoreError::NotFound(id.to_string()))
    }

    /// Write a live record. A record already terminal on disk is never
    /// overwritten.
    pub async fn save(&self, job: &MigrationJob) -> Result<(), JobStoreError> {
        let path = self.live_path(job.id());
        if let Some(stored) = persist::read_json::<MigrationJob>(&path).await? {
            if stored.state.is_terminal() && stored.attempt == job.attempt && stored != *job {
                return Err(JobStoreError::Immutable {
                    id: stored.spec.id,
                    state: stored.state,
                });
            }
        }
        persist::write_json(&path, job).await?;
        debug!(job_id = job.id(), state = %job.state, "job saved");
        Ok(())
    }

    /// Move a terminal record into the archive.
    pub async fn archive(&self, job: &MigrationJob) -> Result<PathBuf, JobStoreError> {
        if !job.state.is_terminal() {
            return Err(JobStoreError::Immutable {
                id: job.id().to_string(),
                state: job.state,
            });
        }
        let target = self.archive_path(job.id(), job.attempt);
        persist::write_json(&target, job).await?;
        persist::remove(&self.live_path(job.id())).await?;
        persist::remove(&self.cancel_path(job.id())).await?;
        info!(job_id = job.id(), attempt = job.attempt, path = %target.display(), "job archived");
        Ok(target)
    }

    /// Newest archived attempt of a job.
    pub async fn load_archived(&self, id: &str) -> Result<Option<MigrationJob>, JobStoreError> {
        let mut best: Option<MigrationJob> = None;
        for (file_id, attempt) in self.archived_entries().await? {
            if file_id != id || best.as_ref().is_some_and(|b| b.attempt >= attempt) {
                continue;
            }
            if let Some(job) = persist::read_json(&self.archive_path(id, attempt)).await? {
                best = Some(job);
            }
        }
        Ok(best)
    }

    async fn archived_entries(&self) -> Result<Vec<(String, u32)>, JobStoreError> {
        let mut out = Vec::new();
        for name in list_json(&self.archive).await? {
            if let Some((id, attempt)) = name.rsplit_once('.') {
                if let Ok(attempt) = attempt.parse::<u32>() {
                    out.push((id.to_string(), attempt));
                }
            }
        }
        Ok(out)
    }

    /// Every live record, sorted by id.
    pub async fn list(&self) -> Result<Vec<MigrationJob>, JobStoreError> {
        let mut jobs = Vec::new();
        for id in list_json(&self.jobs).await? {
            if let Some(job) = self.try_load(&id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        Ok(jobs)
    }

    /// Latest known record per job id, live records winning over archives.
    pub async fn known_jobs(&self) -> Result<BTreeMap<String, MigrationJob>, JobStoreError> {
        let mut known = BTreeMap::new();
        let mut ids: Vec<String> = self
            .archived_entries()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            if let Some(job) = self.load_archived(&id).await? {
                known.insert(id, job);
            }
        }
        for job in self.list().await? {
            known.insert(job.spec.id.clone(), job);
        }
        Ok(known)
    }

    /// Leave a cancel marker for whoever drives the job.
    pub async fn request_cancel(&self, id: &str) -> Result<(), JobStoreError> {
        persist::write_json(&self.cancel_path(id), &chrono::Utc::now()).await?;
        Ok(())
    }

    /// Whether a cancel marker exists.
    pub async fn cancel_requested(&self, id: &str) -> bool {
        fs::try_exists(self.cancel_path(id)).await.unwrap_or(false)
    }

    /// Remove the cancel marker.
    pub async fn clear_cancel(&self, id: &str) -> Result<(), JobStoreError> {
        persist::remove(&self.cancel_path(id)).await?;
        Ok(())
    }
}

/// Stems of `*.json` files in `dir`. A missing directory is empty.
async fn list_json(dir: &Path) -> Result<Vec<String>, PersistError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".json") {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}
