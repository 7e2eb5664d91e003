//! Consistency Validator
//!
//! Compares each table of a job on both sides: exact row counts, then an
//! order-independent checksum. Tables above `sample_threshold_rows` are
//! checksummed over a deterministic sample (rows whose row hash is a
//! multiple of `sample_modulus`), so both sides hash exactly the same
//! subset without coordinating.
//!
//! Drift is reported in the result; only an unreachable side is an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{Database, DbResult, Lsn, Sampling, TableChecksum};
use crate::job::{ChecksumPolicy, MigrationJob};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// Validator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Tables with more rows than this are sampled.
    pub sample_threshold_rows: u64,
    /// Sampling modulus; one row in `sample_modulus` is hashed on average.
    pub sample_modulus: u32,
    /// Budget for one table comparison.
    pub check_timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            sample_threshold_rows: 1_000_000,
            sample_modulus: 64,
            check_timeout_ms: 120_000,
        }
    }
}

/// Validator errors.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// One side could not be reached.
    #[error("validator cannot reach {side} '{connection}': {reason}")]
    Unreachable {
        /// `source` or `target`.
        side: &'static str,
        /// Connection name.
        connection: String,
        /// Why.
        reason: String,
    },
}

/// Comparison of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheck {
    /// Table.
    pub table: String,
    /// Source row count.
    pub source_rows: Option<u64>,
    /// Target row count.
    pub target_rows: Option<u64>,
    /// Coverage of the checksums.
    pub sampling: Sampling,
    /// Source digest.
    pub source_checksum: Option<TableChecksum>,
    /// Target digest.
    pub target_checksum: Option<TableChecksum>,
    /// Absolute row-count difference.
    pub row_drift: u64,
    /// Whether the digests matched; `None` when not compared.
    pub checksum_match: Option<bool>,
    /// Verdict for this table.
    pub passed: bool,
    /// Query failure, if any.
    pub error: Option<String>,
}

/// Verdict of one validator run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyCheckResult {
    /// Job checked.
    pub job_id: String,
    /// When the run finished.
    pub checked_at: DateTime<Utc>,
    /// Source WAL position at the start of the run.
    pub source_lsn: Option<Lsn>,
    /// Largest replication lag seen during the run; `None` if unknown.
    pub lag_bytes: Option<u64>,
    /// Per-table details.
    pub tables: Vec<TableCheck>,
    /// Overall verdict.
    pub passed: bool,
    /// Sum of row drift across tables.
    pub drift_rows: u64,
}

impl ConsistencyCheckResult {
    /// Tables that failed.
    pub fn failing_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| !t.passed)
            .map(|t| t.table.as_str())
            .collect()
    }
}

/// Runs consistency checks.
pub struct ConsistencyValidator {
    registry: Arc<ConnectionRegistry>,
    config: ValidatorConfig,
}

impl ConsistencyValidator {
    /// New validator.
    pub fn new(registry: Arc<ConnectionRegistry>, config: ValidatorConfig) -> Self {
        Self { registry, config }
    }

    async fn side<'a>(
        &'a self,
        side: &'static str,
        connection: &str,
    ) -> Result<ConnectionHandle<'a>, ValidatorError> {
        let unreachable = |reason: String| ValidatorError::Unreachable {
            side,
            connection: connection.to_string(),
            reason,
        };
        let handle = self
            .registry
            .resolve(connection)
            .await
            .map_err(|e| unreachable(e.to_string()))?;
        handle.ping().await.map_err(|e| unreachable(e.to_string()))?;
        Ok(handle)
    }

    /// Compare every table of `job` between source and target.
    pub async fn check(&self, job: &MigrationJob) -> Result<ConsistencyCheckResult, ValidatorError> {
        let spec = &job.spec;
        let source = self.side("source", &spec.source).await?;
        let target = self.side("target", &spec.target).await?;

        let slot = job.replication.as_ref().map(|h| h.slot.clone());
        let lag_before = slot_lag(&*source, slot.as_deref()).await;
        let source_lsn = source.current_lsn().await.ok();

        let mut tables = Vec::with_capacity(spec.tables.len());
        for table in &spec.tables {
            let check = self
                .check_table(&*source, &*target, table, &spec.checksum)
                .await;
            if !check.passed {
                warn!(
                    job_id = %spec.id,
                    table = %table,
                    source_rows = ?check.source_rows,
                    target_rows = ?check.target_rows,
                    error = ?check.error,
                    "table check failed"
                );
            }
            tables.push(check);
        }

        let lag_after = slot_lag(&*source, slot.as_deref()).await;
        let lag_bytes = match (lag_before, lag_after) {
            (Some(a), Some(b)) => Some(a.max(b)),
            _ => None,
        };
        let passed = tables.iter().all(|t| t.passed);
        let result = ConsistencyCheckResult {
            job_id: spec.id.clone(),
            checked_at: Utc::now(),
            source_lsn,
            lag_bytes,
            drift_rows: tables.iter().map(|t| t.row_drift).sum(),
            tables,
            passed,
        };
        info!(
            job_id = %spec.id,
            passed,
            drift_rows = result.drift_rows,
            lag_bytes = ?lag_bytes,
            "consistency check finished"
        );
        Ok(result)
    }

    async fn check_table(
        &self,
        source: &dyn Database,
        target: &dyn Database,
        table: &str,
        policy: &ChecksumPolicy,
    ) -> TableCheck {
        let mut check = TableCheck {
            table: table.to_string(),
            source_rows: None,
            target_rows: None,
            sampling: Sampling::Full,
            source_checksum: None,
            target_checksum: None,
            row_drift: 0,
            checksum_match: None,
            passed: false,
            error: None,
        };
        let budget = Duration::from_millis(self.config.check_timeout_ms);
        let compare = self.compare(source, target, table, policy, &mut check);
        let outcome = tokio::time::timeout(budget, compare).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => check.error = Some(e.to_string()),
            Err(_) => check.error = Some(format!("comparison exceeded {}ms", budget.as_millis())),
        }
        check.passed = check.error.is_none()
            && check.row_drift <= policy.row_count_tolerance
            && check.checksum_match != Some(false);
        check
    }

    async fn compare(
        &self,
        source: &dyn Database,
        target: &dyn Database,
        table: &str,
        policy: &ChecksumPolicy,
        check: &mut TableCheck,
    ) -> DbResult<()> {
        let (s, t) = tokio::join!(source.row_count(table), target.row_count(table));
        let (s, t) = (s?, t?);
        check.source_rows = Some(s);
        check.target_rows = Some(t);
        check.row_drift = s.abs_diff(t);

        // Unequal counts make the digests differ anyway.
        if !policy.require_checksum_match || check.row_drift > 0 {
            return Ok(());
        }
        check.sampling = if s.max(t) > self.config.sample_threshold_rows {
            Sampling::Modulus(self.config.sample_modulus)
        } else {
            Sampling::Full
        };
        let (sc, tc) = tokio::join!(
            source.table_checksum(table, check.sampling),
            target.table_checksum(table, check.sampling)
        );
        let (sc, tc) = (sc?, tc?);
        check.checksum_match = Some(sc == tc);
        check.source_checksum = Some(sc);
        check.target_checksum = Some(tc);
        debug!(table, sampling = ?check.sampling, matched = sc == tc, "checksums compared");
        Ok(())
    }
}

async fn slot_lag(source: &dyn Database, slot: Option<&str>) -> Option<u64> {
    let slot = slot?;
    match source.slot_position(slot).await {
        Ok(Some(pos)) => Some(pos.bytes_behind()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::ConnectionInfo;
    use crate::db::{MemoryConnector, MemoryNetwork};
    use crate::job::JobSpec;

    fn setup(config: ValidatorConfig) -> (MemoryNetwork, ConsistencyValidator, MigrationJob) {
        let network = MemoryNetwork::new();
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(MemoryConnector::new(
            network.clone(),
        ))));
        registry.register("legacy", ConnectionInfo::new(MemoryNetwork::dsn("legacy")));
        registry.register("cluster", ConnectionInfo::new(MemoryNetwork::dsn("cluster")));
        for side in ["legacy", "cluster"] {
            let db = network.node(side);
            db.create_table("users", &["id", "email"]);
            for i in 0..50 {
                let id = i.to_string();
                let email = format!("user{i}@example.com");
                db.insert("users", &[id.as_str(), email.as_str()]).unwrap();
            }
        }
        let job = MigrationJob::new(JobSpec {
            id: "v".into(),
            source: "legacy".into(),
            target: "cluster".into(),
            tables: vec!["users".into()],
            lag_tolerance_ms: 1000,
            checksum: Default::default(),
        });
        (network, ConsistencyValidator::new(registry, config), job)
    }

    #[tokio::test]
    async fn test_identical_tables_pass() {
        let (_net, validator, job) = setup(ValidatorConfig::default());
        let result = validator.check(&job).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.tables[0].checksum_match, Some(true));
        assert_eq!(result.tables[0].sampling, Sampling::Full);
        assert!(result.source_lsn.is_some());
    }

    #[tokio::test]
    async fn test_corruption_fails_without_error() {
        let (net, validator, job) = setup(ValidatorConfig::default());
        net.node("cluster").corrupt("users", "7", 1, "evil").unwrap();
        let result = validator.check(&job).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.failing_tables(), vec!["users"]);
        assert_eq!(result.tables[0].row_drift, 0);
        assert_eq!(result.tables[0].checksum_match, Some(false));
    }

    #[tokio::test]
    async fn test_row_tolerance() {
        let (net, validator, mut job) = setup(ValidatorConfig::default());
        net.node("cluster").delete("users", "3").unwrap();
        assert!(!validator.check(&job).await.unwrap().passed);

        job.spec.checksum.row_count_tolerance = 1;
        let result = validator.check(&job).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.drift_rows, 1);
        assert_eq!(result.tables[0].checksum_match, None);
    }

    #[tokio::test]
    async fn test_large_tables_are_sampled() {
        let (_net, validator, job) = setup(ValidatorConfig {
            sample_threshold_rows: 10,
            sample_modulus: 4,
            ..Default::default()
        });
        let result = validator.check(&job).await.unwrap();
        let table = &result.tables[0];
        assert_eq!(table.sampling, Sampling::Modulus(4));
        assert!(table.source_checksum.unwrap().rows_hashed < 50);
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_missing_table_is_a_failing_result() {
        let (_net, validator, mut job) = setup(ValidatorConfig::default());
        job.spec.tables.push("orders".into());
        let result = validator.check(&job).await.unwrap();
        assert!(!result.passed);
        assert!(result.tables[1].error.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_side_is_an_error() {
        let (net, validator, job) = setup(ValidatorConfig::default());
        net.node("cluster").set_unreachable(true);
        let err = validator.check(&job).await.unwrap_err();
        assert!(matches!(err, ValidatorError::Unreachable { side: "target", .. }));
    }
}
