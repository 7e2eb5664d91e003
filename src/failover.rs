//! Failover drill
//!
//! Deletes the target cluster's primary through the management API and
//! measures how long the operator takes to promote a replacement, then
//! checks that the new primary accepts a write. Advisory only: the drill is
//! never started by the coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, ClusterApiError, ClusterMember};
use crate::metrics;
use crate::registry::ConnectionRegistry;

/// Failover drill configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Promotion must finish within this many seconds.
    pub sla_secs: u64,
    /// Give up waiting for a new primary after this long.
    pub promotion_timeout_secs: u64,
    /// Time the new primary has to accept a probe write.
    pub write_window_secs: u64,
    /// Cluster API poll interval.
    pub poll_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            sla_secs: 15,
            promotion_timeout_secs: 120,
            write_window_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

/// Failover drill errors.
#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    /// The cluster API failed.
    #[error(transparent)]
    Cluster(#[from] ClusterApiError),

    /// There is no single ready primary to delete.
    #[error("cluster has no single ready primary to fail over")]
    NoPrimary,

    /// The drill was refused.
    #[error("failover drill refused: {0}")]
    Refused(String),
}

/// Outcome of one drill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionReport {
    /// Connection the drill ran against.
    pub target: String,
    /// Member that was deleted.
    pub deleted_primary: String,
    /// Member promoted in its place, if any.
    pub new_primary: Option<String>,
    /// Time from deletion to a ready replacement primary.
    pub time_to_new_primary: Option<Duration>,
    /// The new primary accepted a probe write in time.
    pub write_accepted: bool,
    /// Promotion finished within the SLA.
    pub within_sla: bool,
    /// SLA the drill was measured against.
    pub sla: Duration,
}

/// Runs failover drills against the target cluster.
pub struct FailoverHarness {
    api: Arc<dyn ClusterApi>,
    registry: Arc<ConnectionRegistry>,
    config: FailoverConfig,
}

impl FailoverHarness {
    /// New harness.
    pub fn new(
        api: Arc<dyn ClusterApi>,
        registry: Arc<ConnectionRegistry>,
        config: FailoverConfig,
    ) -> Self {
        Self {
            api,
            registry,
            config,
        }
    }

    /// Delete the primary of `target` and measure the promotion.
    ///
    /// A missing promotion or a refused write shows up in the report, not
    /// as an error.
    pub async fn simulate_primary_loss(&self, target: &str) -> Result<PromotionReport, FailoverError> {
        if self.registry.info(target).is_none() {
            return Err(FailoverError::Refused(format!(
                "'{target}' is not a registered connection"
            )));
        }
        let primary = self.api.primary().await?.ok_or(FailoverError::NoPrimary)?;
        let sla = Duration::from_secs(self.config.sla_secs);

        warn!(target, member = %primary.name, "deleting primary for failover drill");
        let started = Instant::now();
        self.api.delete_member(&primary.name).await?;

        let promoted = self.wait_for_promotion(&primary.name).await;
        let time_to_new_primary = promoted.as_ref().map(|_| started.elapsed());
        let write_accepted = match promoted {
            Some(ref member) => {
                let connection = member.connection.as_deref().unwrap_or(target);
                self.probe_write(connection).await
            }
            None => false,
        };
        let within_sla = time_to_new_primary.is_some_and(|t| t <= sla);
        let outcome = metrics::drill_outcome(promoted.is_some(), write_accepted, within_sla);
        metrics::record_failover_drill(time_to_new_primary, outcome);

        let report = PromotionReport {
            target: target.to_string(),
            deleted_primary: primary.name,
            new_primary: promoted.map(|m| m.name),
            time_to_new_primary,
            write_accepted,
            within_sla,
            sla,
        };
        info!(
            target,
            new_primary = ?report.new_primary,
            elapsed_ms = ?report.time_to_new_primary.map(|d| d.as_millis() as u64),
            write_accepted,
            within_sla,
            "failover drill finished"
        );
        Ok(report)
    }

    async fn wait_for_promotion(&self, deleted: &str) -> Option<ClusterMember> {
        let deadline = Instant::now() + Duration::from_secs(self.config.promotion_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        while Instant::now() < deadline {
            match self.api.primary().await {
                Ok(Some(member)) if member.name != deleted => return Some(member),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "cluster API poll failed during promotion"),
            }
            tokio::time::sleep(interval).await;
        }
        None
    }

    async fn probe_write(&self, connection: &str) -> bool {
        let window = Duration::from_secs(self.config.write_window_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let attempt = async {
            loop {
                let result = match self.registry.resolve(connection).await {
                    Ok(db) => db.probe_write().await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match result {
                    Ok(()) => return,
                    Err(reason) => debug!(connection, %reason, "probe write refused, retrying"),
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(window, attempt).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::cluster::MemberRole;
    use crate::config::ConnectionInfo;
    use crate::db::{MemoryConnector, MemoryNetwork};

    /// Promotes `standby` the first time the primary is listed as missing.
    struct OneShotCluster {
        members: Mutex<Vec<ClusterMember>>,
    }

    #[async_trait]
    impl ClusterApi for OneShotCluster {
        async fn members(&self) -> Result<Vec<ClusterMember>, ClusterApiError> {
            let mut members = self.members.lock();
            if !members.iter().any(|m| m.role == MemberRole::Primary) {
                if let Some(standby) = members.iter_mut().find(|m| m.name == "pg-2") {
                    standby.role = MemberRole::Primary;
                }
            }
            Ok(members.clone())
        }

        async fn delete_member(&self, name: &str) -> Result<(), ClusterApiError> {
            self.members.lock().retain(|m| m.name != name);
            Ok(())
        }
    }

    fn member(name: &str, role: MemberRole, connection: &str) -> ClusterMember {
        ClusterMember {
            name: name.into(),
            role,
            ready: true,
            connection: Some(connection.into()),
        }
    }

    fn harness(network: &MemoryNetwork, api: Arc<dyn ClusterApi>) -> FailoverHarness {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(MemoryConnector::new(
            network.clone(),
        ))));
        registry.register("cluster", ConnectionInfo::new(MemoryNetwork::dsn("pg-1")));
        registry.register("cluster-2", ConnectionInfo::new(MemoryNetwork::dsn("pg-2")));
        FailoverHarness::new(
            api,
            registry,
            FailoverConfig {
                promotion_timeout_secs: 2,
                write_window_secs: 1,
                poll_interval_ms: 10,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_promotion_measured() {
        let network = MemoryNetwork::new();
        network.node("pg-1");
        network.node("pg-2");
        let api = Arc::new(OneShotCluster {
            members: Mutex::new(vec![
                member("pg-1", MemberRole::Primary, "cluster"),
                member("pg-2", MemberRole::Replica, "cluster-2"),
            ]),
        });
        let report = harness(&network, api)
            .simulate_primary_loss("cluster")
            .await
            .unwrap();
        assert_eq!(report.deleted_primary, "pg-1");
        assert_eq!(report.new_primary.as_deref(), Some("pg-2"));
        assert!(report.write_accepted);
        assert!(report.within_sla);
    }

    #[tokio::test]
    async fn test_read_only_promotion_reports_refused_write() {
        let network = MemoryNetwork::new();
        network.node("pg-2").set_read_only(true);
        let api = Arc::new(OneShotCluster {
            members: Mutex::new(vec![
                member("pg-1", MemberRole::Primary, "cluster"),
                member("pg-2", MemberRole::Replica, "cluster-2"),
            ]),
        });
        let report = harness(&network, api)
            .simulate_primary_loss("cluster")
            .await
            .unwrap();
        assert!(report.new_primary.is_some());
        assert!(!report.write_accepted);
    }

    #[tokio::test]
    async fn test_no_primary() {
        let network = MemoryNetwork::new();
        let api = Arc::new(OneShotCluster {
            members: Mutex::new(vec![member("pg-9", MemberRole::Unknown, "cluster")]),
        });
        let err = harness(&network, api)
            .simulate_primary_loss("cluster")
            .await
            .unwrap_err();
        assert!(matches!(err, FailoverError::NoPrimary));
    }
}
