//! Replication Controller
//!
//! Owns the logical replication channel of a job: a publication and an
//! anchored slot on the source, and a subscription on the target attached
//! to that slot. The slot is created by the snapshot export, so the
//! subscription starts exactly where the snapshot ends.
//!
//! All three objects share one name derived from the job id, which is what
//! lets [`reconcile::sweep`] attribute a slot to its job after a crash.

pub mod reconcile;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{Database, DbError, Lsn, SubscriptionSpec};
use crate::job::MigrationJob;
use crate::metrics;
use crate::registry::{ConnectionRegistry, RegistryError};
use crate::snapshot::{import_snapshot, ImportError};
use crate::store::BackupStore;

pub use reconcile::{sweep, SweepReport};

/// PostgreSQL identifier length limit.
const MAX_IDENT_LEN: usize = 63;

/// Replication controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Attempts for `establish` before giving up.
    pub establish_attempts: u32,
    /// Base delay for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum backoff delay cap.
    pub backoff_max_ms: u64,
    /// Budget for one lag poll.
    pub lag_poll_timeout_ms: u64,
    /// Prefix of every slot, publication and subscription name.
    pub slot_prefix: String,
    /// How long a rolled-back job keeps its slot for a retry.
    pub rolled_back_retention_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            establish_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            lag_poll_timeout_ms: 2_000,
            slot_prefix: "pgshift".to_string(),
            rolled_back_retention_secs: 86_400,
        }
    }
}

impl ReplicationConfig {
    /// Backoff policy from the configured bounds.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Cap.
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `2^(attempt-1) * base`,
    /// capped at `max`, with ±25% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let shift = attempt.clamp(1, 20) - 1;
        let exp = base_ms.saturating_mul(1u64.checked_shl(shift).unwrap_or(u64::MAX));
        let capped = exp.min(max_ms);
        let jitter = (capped / 4) as i64;
        let offset = if jitter > 0 {
            (rand::random::<u64>() % (jitter as u64 * 2)) as i64 - jitter
        } else {
            0
        };
        Duration::from_millis((capped as i64 + offset).max(1) as u64)
    }
}

/// Names of the replication objects belonging to one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationNames {
    /// Logical slot on the source.
    pub slot: String,
    /// Publication on the source.
    pub publication: String,
    /// Subscription on the target.
    pub subscription: String,
}

impl ReplicationNames {
    /// `<prefix>_<sanitised job id>`, lowercased, non `[a-z0-9_]` replaced
    /// by `_`. Names longer than the identifier limit are shortened and
    /// suffixed with a hash of the full name.
    pub fn for_job(prefix: &str, job_id: &str) -> Self {
        let sanitised: String = job_id
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        let mut name = format!("{prefix}_{sanitised}");
        if name.len() > MAX_IDENT_LEN {
            let hash = crc32fast::hash(name.as_bytes());
            name.truncate(MAX_IDENT_LEN - 9);
            name = format!("{name}_{hash:08x}");
        }
        Self::shared(name)
    }

    /// Names for objects that all carry `name`.
    pub fn shared(name: String) -> Self {
        Self {
            slot: name.clone(),
            publication: name.clone(),
            subscription: name,
        }
    }
}

/// Replication failures.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The source rejected a call.
    #[error("source: {0}")]
    Source(#[source] DbError),

    /// The target rejected a call.
    #[error("target: {0}")]
    Target(#[source] DbError),

    /// A connection could not be resolved.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Loading the snapshot into the target failed.
    #[error("snapshot import: {0}")]
    Import(#[from] ImportError),

    /// The job has no exported snapshot.
    #[error("job {0} has no snapshot to establish replication from")]
    MissingSnapshot(String),

    /// The anchored slot is gone; the snapshot can no longer be resumed.
    #[error("replication slot {slot} no longer exists on {source_name}")]
    SlotMissing {
        /// Slot name.
        slot: String,
        /// Source connection.
        source_name: String,
    },

    /// Transient failures outlasted the retry budget.
    #[error("establish gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last error.
        last: String,
    },
}

impl ReplicationError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source(e) | Self::Target(e) => e.is_transient(),
            Self::Registry(e) => e.is_transient(),
            Self::Import(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// The replication channel of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSlotHandle {
    /// Owning job.
    pub job_id: String,
    /// Source connection name.
    pub source: String,
    /// Target connection name.
    pub target: String,
    /// Logical slot on the source.
    pub slot: String,
    /// Publication on the source.
    pub publication: String,
    /// Subscription on the target.
    pub subscription: String,
    /// Position the subscription started from.
    pub start_lsn: Lsn,
    /// When the subscription was created.
    pub established_at: DateTime<Utc>,
    /// Bytes behind at the last successful poll.
    pub last_lag_bytes: Option<u64>,
    /// Estimated catch-up time at the last successful poll.
    pub last_lag_ms: Option<u64>,
    /// Confirmed position at the last successful poll.
    pub last_confirmed_lsn: Option<Lsn>,
}

impl ReplicationSlotHandle {
    /// Object names as a set.
    pub fn names(&self) -> ReplicationNames {
        ReplicationNames {
            slot: self.slot.clone(),
            publication: self.publication.clone(),
            subscription: self.subscription.clone(),
        }
    }

    /// Fold a lag report into the handle's last-known figures.
    pub fn observe(&mut self, report: &LagReport) {
        if let LagReport::Known(sample) = report {
            self.last_lag_bytes = Some(sample.bytes_behind);
            self.last_lag_ms = sample.eta.map(|d| d.as_millis() as u64);
            self.last_confirmed_lsn = Some(sample.confirmed_lsn);
        }
    }
}

/// A successful lag measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct LagSample {
    /// WAL the subscriber has not yet confirmed.
    pub bytes_behind: u64,
    /// Source WAL position at poll time.
    pub source_lsn: Lsn,
    /// Subscriber's confirmed position.
    pub confirmed_lsn: Lsn,
    /// Estimated time to catch up at the observed apply rate; `None` while
    /// the rate is unknown or zero.
    pub eta: Option<Duration>,
    /// Whether the subscriber is attached.
    pub active: bool,
}

/// Result of one lag poll.
#[derive(Debug, Clone, PartialEq)]
pub enum LagReport {
    /// Measured.
    Known(LagSample),
    /// Could not be measured; never read as zero lag.
    Unknown {
        /// Why.
        reason: String,
    },
}

impl LagReport {
    /// Bytes behind, if measured.
    pub fn bytes_behind(&self) -> Option<u64> {
        match self {
            Self::Known(s) => Some(s.bytes_behind),
            Self::Unknown { .. } => None,
        }
    }

    /// Whether lag is measured and within `tolerance`.
    pub fn within(&self, tolerance: Duration) -> bool {
        match self {
            Self::Known(s) => s.bytes_behind == 0 || s.eta.is_some_and(|eta| eta <= tolerance),
            Self::Unknown { .. } => false,
        }
    }
}

/// What a teardown removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Subscription dropped from the target.
    pub subscription_dropped: bool,
    /// Publication dropped from the source.
    pub publication_dropped: bool,
    /// Slot dropped from the source.
    pub slot_dropped: bool,
}

struct RateSample {
    lsn: Lsn,
    at: Instant,
    bytes_per_sec: Option<f64>,
}

/// Smoothing factor for the apply-rate moving average.
const RATE_ALPHA: f64 = 0.5;

/// Drives publication, subscription and slot lifecycles.
pub struct ReplicationController {
    registry: Arc<ConnectionRegistry>,
    store: Arc<BackupStore>,
    config: ReplicationConfig,
    rates: DashMap<String, RateSample>,
}

impl ReplicationController {
    /// New controller.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<BackupStore>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            rates: DashMap::new(),
        }
    }

    /// Controller configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Connection registry in use.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Names for a job.
    pub fn names_for(&self, job_id: &str) -> ReplicationNames {
        ReplicationNames::for_job(&self.config.slot_prefix, job_id)
    }

    /// Import the job's snapshot into the target and subscribe it to the
    /// anchored slot. Transient failures are retried with backoff.
    pub async fn establish(
        &self,
        job: &MigrationJob,
    ) -> Result<ReplicationSlotHandle, ReplicationError> {
        let backoff = self.config.backoff();
        let attempts = self.config.establish_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_establish(job).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = backoff.delay(attempt);
                    warn!(
                        job_id = job.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "establish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(ReplicationError::Exhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_establish(
        &self,
        job: &MigrationJob,
    ) -> Result<ReplicationSlotHandle, ReplicationError> {
        let spec = &job.spec;
        let snapshot = job
            .snapshot
            .as_ref()
            .ok_or_else(|| ReplicationError::MissingSnapshot(spec.id.clone()))?;
        let names = self.names_for(&spec.id);
        let source = self.registry.resolve(&spec.source).await?;
        let target = self.registry.resolve(&spec.target).await?;

        let slot = source
            .slot_position(&names.slot)
            .await
            .map_err(ReplicationError::Source)?;
        let subscribed = target
            .subscription_exists(&names.subscription)
            .await
            .map_err(ReplicationError::Target)?;

        if slot.is_none() {
            if subscribed {
                target
                    .drop_subscription(&names.subscription)
                    .await
                    .map_err(ReplicationError::Target)?;
            }
            return Err(ReplicationError::SlotMissing {
                slot: names.slot,
                source_name: spec.source.clone(),
            });
        }

        source
            .ensure_publication(&names.publication, &spec.tables)
            .await
            .map_err(ReplicationError::Source)?;

        if subscribed {
            info!(job_id = %spec.id, subscription = %names.subscription, "subscription already attached, resuming");
        } else {
            import_snapshot(&self.store, snapshot, &*target).await?;
            let conninfo = self
                .registry
                .info(&spec.source)
                .ok_or_else(|| RegistryError::UnresolvedRole(spec.source.clone()))?
                .subscriber_conninfo()
                .to_string();
            target
                .create_subscription(&SubscriptionSpec {
                    name: names.subscription.clone(),
                    source_conninfo: conninfo,
                    publication: names.publication.clone(),
                    slot: names.slot.clone(),
                })
                .await
                .map_err(ReplicationError::Target)?;
            info!(
                job_id = %spec.id,
                slot = %names.slot,
                lsn = %snapshot.consistent_lsn,
                "replication established"
            );
        }

        self.rates.remove(&names.slot);
        Ok(ReplicationSlotHandle {
            job_id: spec.id.clone(),
            source: spec.source.clone(),
            target: spec.target.clone(),
            slot: names.slot,
            publication: names.publication,
            subscription: names.subscription,
            start_lsn: snapshot.consistent_lsn,
            established_at: Utc::now(),
            last_lag_bytes: None,
            last_lag_ms: None,
            last_confirmed_lsn: None,
        })
    }

    /// Measure how far the subscriber trails the source. Bounded by the
    /// poll timeout; any failure is [`LagReport::Unknown`].
    pub async fn poll_lag(&self, handle: &ReplicationSlotHandle) -> LagReport {
        let report = self.measure_lag(handle).await;
        match report {
            LagReport::Known(ref sample) => {
                metrics::record_replication_lag(&handle.job_id, sample.bytes_behind, sample.eta)
            }
            LagReport::Unknown { .. } => metrics::record_replication_lag_unknown(&handle.job_id),
        }
        report
    }

    async fn measure_lag(&self, handle: &ReplicationSlotHandle) -> LagReport {
        let budget = Duration::from_millis(self.config.lag_poll_timeout_ms);
        let probe = async {
            let source = self
                .registry
                .resolve(&handle.source)
                .await
                .map_err(|e| e.to_string())?;
            source
                .slot_position(&handle.slot)
                .await
                .map_err(|e| e.to_string())
        };
        let position = match tokio::time::timeout(budget, probe).await {
            Err(_) => {
                return LagReport::Unknown {
                    reason: format!("no answer within {}ms", budget.as_millis()),
                }
            }
            Ok(Err(reason)) => return LagReport::Unknown { reason },
            Ok(Ok(None)) => {
                return LagReport::Unknown {
                    reason: format!("slot {} does not exist", handle.slot),
                }
            }
            Ok(Ok(Some(position))) => position,
        };

        let confirmed = position.confirmed_flush_lsn.unwrap_or(handle.start_lsn);
        let bytes_behind = position.current_lsn.bytes_since(confirmed);
        let rate = self.observe_rate(&handle.slot, confirmed);
        let eta = if bytes_behind == 0 {
            Some(Duration::ZERO)
        } else {
            rate.filter(|r| *r > 0.0)
                .map(|r| Duration::from_secs_f64(bytes_behind as f64 / r))
        };
        debug!(
            job_id = %handle.job_id,
            lag_bytes = bytes_behind,
            lsn = %position.current_lsn,
            confirmed = %confirmed,
            "lag polled"
        );
        LagReport::Known(LagSample {
            bytes_behind,
            source_lsn: position.current_lsn,
            confirmed_lsn: confirmed,
            eta,
            active: position.active,
        })
    }

    fn observe_rate(&self, slot: &str, confirmed: Lsn) -> Option<f64> {
        let now = Instant::now();
        let mut entry = self.rates.entry(slot.to_string()).or_insert(RateSample {
            lsn: confirmed,
            at: now,
            bytes_per_sec: None,
        });
        let elapsed = now.duration_since(entry.at).as_secs_f64();
        if elapsed > 0.0 && confirmed > entry.lsn {
            let instant = confirmed.bytes_since(entry.lsn) as f64 / elapsed;
            entry.bytes_per_sec = Some(match entry.bytes_per_sec {
                Some(prev) => RATE_ALPHA * instant + (1.0 - RATE_ALPHA) * prev,
                None => instant,
            });
            entry.lsn = confirmed;
            entry.at = now;
        }
        entry.bytes_per_sec
    }

    /// Drop the subscription, then the publication and the slot. Safe to
    /// call repeatedly.
    pub async fn teardown(
        &self,
        handle: &ReplicationSlotHandle,
    ) -> Result<TeardownReport, ReplicationError> {
        self.teardown_names(&handle.source, Some(&handle.target), &handle.names())
            .await
    }

    /// Teardown by names. Without a known target every other registered
    /// connection is checked for the subscription.
    pub async fn teardown_names(
        &self,
        source_name: &str,
        target_name: Option<&str>,
        names: &ReplicationNames,
    ) -> Result<TeardownReport, ReplicationError> {
        let mut report = TeardownReport::default();

        let candidates: Vec<String> = match target_name {
            Some(t) => vec![t.to_string()],
            None => self
                .registry
                .names()
                .into_iter()
                .filter(|n| n != source_name)
                .collect(),
        };
        for name in candidates {
            match self.drop_subscription_on(&name, &names.subscription).await {
                Ok(dropped) => report.subscription_dropped |= dropped,
                // The slot drop below fails if the subscriber is still attached.
                Err(e) => warn!(connection = %name, subscription = %names.subscription, error = %e, "could not drop subscription"),
            }
        }

        let source = self.registry.resolve(source_name).await?;
        report.publication_dropped = source
            .drop_publication(&names.publication)
            .await
            .map_err(ReplicationError::Source)?;
        report.slot_dropped = source
            .drop_slot(&names.slot)
            .await
            .map_err(ReplicationError::Source)?;
        self.rates.remove(&names.slot);

        info!(
            slot = %names.slot,
            subscription = report.subscription_dropped,
            publication = report.publication_dropped,
            dropped = report.slot_dropped,
            "replication torn down"
        );
        Ok(report)
    }

    async fn drop_subscription_on(
        &self,
        connection: &str,
        subscription: &str,
    ) -> Result<bool, ReplicationError> {
        let db = self.registry.resolve(connection).await?;
        let dropped = db
            .drop_subscription(subscription)
            .await
            .map_err(ReplicationError::Target)?;
        Ok(dropped)
    }

    /// Whether `slot` still exists on `source`.
    pub async fn slot_exists(&self, source: &str, slot: &str) -> Result<bool, ReplicationError> {
        let db = self.registry.resolve(source).await?;
        let position = db
            .slot_position(slot)
            .await
            .map_err(ReplicationError::Source)?;
        Ok(position.is_some())
    }

    /// Current source WAL position.
    pub async fn source_lsn(&self, source: &str) -> Result<Lsn, ReplicationError> {
        let db = self.registry.resolve(source).await?;
        current_lsn(&*db).await
    }
}

async fn current_lsn(db: &dyn Database) -> Result<Lsn, ReplicationError> {
    db.current_lsn().await.map_err(ReplicationError::Source)
}
