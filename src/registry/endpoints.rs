//! Endpoint Registry
//!
//! Maps logical roles (`primary-write`, `read-only`) to the connection
//! serving them. The mapping is what applications follow, so a change is
//! persisted before it becomes visible and a role can only be repointed at a
//! connection that has just been confirmed live.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{LiveEndpoint, RegistryError};
use crate::config::EndpointsConfig;
use crate::persist;

/// File name of the registry under the state directory.
pub const ENDPOINTS_FILE: &str = "endpoints.json";

/// Oldest liveness proof accepted for a repoint.
pub const MAX_PROOF_AGE: Duration = Duration::from_secs(10);

/// Logical endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointRole {
    /// Receives application writes.
    PrimaryWrite,
    /// Receives read-only traffic.
    ReadOnly,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrimaryWrite => write!(f, "primary-write"),
            Self::ReadOnly => write!(f, "read-only"),
        }
    }
}

impl FromStr for EndpointRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary-write" => Ok(Self::PrimaryWrite),
            "read-only" => Ok(Self::ReadOnly),
            other => Err(format!("unknown endpoint role '{other}'")),
        }
    }
}

/// Where one role currently points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointEntry {
    /// Role.
    pub role: EndpointRole,
    /// Connection name serving the role.
    pub connection: String,
    /// Bumped on every change.
    pub generation: u64,
    /// Time of the last change.
    pub updated_at: DateTime<Utc>,
    /// Liveness confirmation that justified the last change.
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Result of a repoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepointOutcome {
    /// The role moved.
    Changed {
        /// Previous connection, if any.
        from: Option<String>,
        /// New connection.
        to: String,
    },
    /// The role already pointed at the requested connection.
    Unchanged,
}

/// Persistent role to connection mapping.
pub struct EndpointRegistry {
    path: PathBuf,
    entries: RwLock<BTreeMap<EndpointRole, EndpointEntry>>,
    writer: tokio::sync::Mutex<()>,
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("path", &self.path)
            .field("entries", &*self.entries.read())
            .finish()
    }
}

impl EndpointRegistry {
    /// Load the registry from `state_dir`, seeding it from `defaults` when
    /// no file exists yet.
    pub async fn open(state_dir: &Path, defaults: &EndpointsConfig) -> Result<Self, RegistryError> {
        let path = state_dir.join(ENDPOINTS_FILE);
        let stored: Option<Vec<EndpointEntry>> = persist::read_json(&path).await?;

        let entries = match stored {
            Some(list) => list.into_iter().map(|e| (e.role, e)).collect(),
            None => {
                let now = Utc::now();
                let mut seeded = BTreeMap::new();
                if !defaults.primary_write.is_empty() {
                    seeded.insert(
                        EndpointRole::PrimaryWrite,
                        EndpointEntry {
                            role: EndpointRole::PrimaryWrite,
                            connection: defaults.primary_write.clone(),
                            generation: 0,
                            updated_at: now,
                            confirmed_at: None,
                        },
                    );
                }
                if let Some(ref ro) = defaults.read_only {
                    seeded.insert(
                        EndpointRole::ReadOnly,
                        EndpointEntry {
                            role: EndpointRole::ReadOnly,
                            connection: ro.clone(),
                            generation: 0,
                            updated_at: now,
                            confirmed_at: None,
                        },
                    );
                }
                let list: Vec<&EndpointEntry> = seeded.values().collect();
                persist::write_json(&path, &list).await?;
                seeded
            }
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: tokio::sync::Mutex::new(()),
        })
    }

    /// Current entry for `role`.
    pub fn get(&self, role: EndpointRole) -> Option<EndpointEntry> {
        self.entries.read().get(&role).cloned()
    }

    /// Connection currently serving `role`.
    pub fn connection(&self, role: EndpointRole) -> Option<String> {
        self.entries.read().get(&role).map(|e| e.connection.clone())
    }

    /// Copy of every entry.
    pub fn snapshot(&self) -> BTreeMap<EndpointRole, EndpointEntry> {
        self.entries.read().clone()
    }

    /// Point `role` at the connection named in `proof`.
    ///
    /// The change is written to disk before it is published in memory.
    /// Repointing at the current connection is a no-op.
    pub(crate) async fn repoint(
        &self,
        role: EndpointRole,
        proof: &LiveEndpoint,
    ) -> Result<RepointOutcome, RegistryError> {
        let age = Utc::now() - proof.confirmed_at;
        let max_age = chrono::Duration::milliseconds(MAX_PROOF_AGE.as_millis() as i64);
        if age > max_age {
            return Err(RegistryError::StaleProof {
                name: proof.name.clone(),
                age_ms: age.num_milliseconds(),
            });
        }

        let _writer = self.writer.lock().await;
        let mut next = self.entries.read().clone();
        let previous = next.get(&role).map(|e| e.connection.clone());
        if previous.as_deref() == Some(proof.name.as_str()) {
            return Ok(RepointOutcome::Unchanged);
        }

        let generation = next.get(&role).map(|e| e.generation + 1).unwrap_or(1);
        next.insert(
            role,
            EndpointEntry {
                role,
                connection: proof.name.clone(),
                generation,
                updated_at: Utc::now(),
                confirmed_at: Some(proof.confirmed_at),
            },
        );
        let list: Vec<&EndpointEntry> = next.values().collect();
        persist::write_json(&self.path, &list).await?;
        *self.entries.write() = next;

        info!(
            role = %role,
            from = previous.as_deref().unwrap_or("-"),
            to = %proof.name,
            generation,
            "endpoint repointed"
        );
        Ok(RepointOutcome::Changed {
            from: previous,
            to: proof.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn defaults() -> EndpointsConfig {
        EndpointsConfig {
            primary_write: "legacy".into(),
            read_only: Some("legacy".into()),
        }
    }

    fn proof(name: &str, confirmed_at: DateTime<Utc>) -> LiveEndpoint {
        LiveEndpoint {
            name: name.into(),
            confirmed_at,
        }
    }

    #[test]
    fn test_role_names() {
        assert_eq!(EndpointRole::PrimaryWrite.to_string(), "primary-write");
        assert_eq!("read-only".parse::<EndpointRole>().unwrap(), EndpointRole::ReadOnly);
        assert!("writer".parse::<EndpointRole>().is_err());
    }

    #[tokio::test]
    async fn test_seed_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let reg = EndpointRegistry::open(dir.path(), &defaults()).await.unwrap();
        assert_eq!(
            reg.connection(EndpointRole::PrimaryWrite).as_deref(),
            Some("legacy")
        );

        let outcome = reg
            .repoint(EndpointRole::PrimaryWrite, &proof("cluster", Utc::now()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RepointOutcome::Changed {
                from: Some("legacy".into()),
                to: "cluster".into()
            }
        );

        let reopened = EndpointRegistry::open(dir.path(), &defaults()).await.unwrap();
        let entry = reopened.get(EndpointRole::PrimaryWrite).unwrap();
        assert_eq!(entry.connection, "cluster");
        assert_eq!(entry.generation, 1);
        assert_eq!(
            reopened.connection(EndpointRole::ReadOnly).as_deref(),
            Some("legacy")
        );
    }

    #[tokio::test]
    async fn test_repoint_same_target_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let reg = EndpointRegistry::open(dir.path(), &defaults()).await.unwrap();
        let before = reg.snapshot();
        let outcome = reg
            .repoint(EndpointRole::PrimaryWrite, &proof("legacy", Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, RepointOutcome::Unchanged);
        assert_eq!(reg.snapshot(), before);
    }

    #[tokio::test]
    async fn test_stale_proof_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let reg = EndpointRegistry::open(dir.path(), &defaults()).await.unwrap();
        let old = Utc::now() - chrono::Duration::seconds(60);
        let err = reg
            .repoint(EndpointRole::PrimaryWrite, &proof("cluster", old))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::StaleProof { .. }));
        assert_eq!(
            reg.connection(EndpointRole::PrimaryWrite).as_deref(),
            Some("legacy")
        );
    }
}
