//! Orphan slot reconciliation
//!
//! A logical slot nobody consumes pins WAL on the source forever. At
//! startup the coordinator lists every slot carrying the orchestrator's
//! prefix on every registered connection and tears down those whose owning
//! job is unknown or finished.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::{ReplicationController, ReplicationNames};
use crate::db::SlotInfo;
use crate::job::{JobState, JobStore, MigrationJob};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Slots inspected, as `connection/slot`.
    pub inspected: Vec<String>,
    /// Slots left in place because their job still needs them.
    pub kept: Vec<String>,
    /// Slots removed.
    pub torn_down: Vec<String>,
    /// Slots deliberately left alone, with the reason.
    pub skipped: Vec<(String, String)>,
    /// Connections or slots that could not be handled.
    pub errors: Vec<(String, String)>,
}

enum Verdict {
    Keep,
    Skip(String),
    TearDown(String),
}

fn judge(owner: Option<&MigrationJob>, retention: Duration) -> Verdict {
    let Some(job) = owner else {
        return Verdict::TearDown("no job owns it".into());
    };
    match job.state {
        s if !s.is_terminal() => Verdict::Keep,
        JobState::Failed if job.requires_operator => {
            Verdict::Skip("owning job failed and requires an operator".into())
        }
        JobState::RolledBack => {
            let age = (Utc::now() - job.updated_at).to_std().unwrap_or_default();
            if age < retention {
                Verdict::Keep
            } else {
                Verdict::TearDown(format!("rolled back {}s ago", age.as_secs()))
            }
        }
        state => Verdict::TearDown(format!("owning job is {state}")),
    }
}

/// Inspect every registered connection and tear down orphaned slots.
///
/// Job records are read after the slots are listed, so a job created while
/// the sweep runs always has its record on disk before its slot is judged.
/// The sweep never fails as a whole; per-connection problems end up in
/// [`SweepReport::errors`].
pub async fn sweep(controller: &ReplicationController, jobs: &JobStore) -> SweepReport {
    let prefix = format!("{}_", controller.config().slot_prefix);
    let retention = Duration::from_secs(controller.config().rolled_back_retention_secs);
    let mut report = SweepReport::default();

    let mut listed: Vec<(String, Vec<SlotInfo>)> = Vec::new();
    for connection in controller.registry().names() {
        let slots = match controller.registry().resolve(&connection).await {
            Ok(db) => db.list_slots(&prefix).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match slots {
            Ok(slots) => listed.push((connection, slots)),
            Err(reason) => {
                warn!(connection = %connection, %reason, "cannot list slots");
                report.errors.push((connection, reason));
            }
        }
    }

    let known = match jobs.known_jobs().await {
        Ok(known) => known,
        Err(e) => {
            warn!(error = %e, "cannot read job records, leaving every slot in place");
            report.errors.push(("jobs".to_string(), e.to_string()));
            return report;
        }
    };
    let owners: BTreeMap<(String, String), &MigrationJob> = known
        .values()
        .map(|job| {
            let names = controller.names_for(job.id());
            ((job.spec.source.clone(), names.slot), job)
        })
        .collect();

    for (connection, slots) in listed {
        for slot in slots {
            let label = format!("{connection}/{}", slot.name);
            report.inspected.push(label.clone());
            let owner = owners
                .get(&(connection.clone(), slot.name.clone()))
                .copied();

            match judge(owner, retention) {
                Verdict::Keep => report.kept.push(label),
                Verdict::Skip(reason) => {
                    warn!(slot = %label, %reason, "leaving slot for operator");
                    report.skipped.push((label, reason));
                }
                Verdict::TearDown(reason) => {
                    let (names, target) = match owner {
                        Some(job) => (
                            controller.names_for(job.id()),
                            Some(job.spec.target.as_str()),
                        ),
                        None => (ReplicationNames::shared(slot.name.clone()), None),
                    };
                    match controller.teardown_names(&connection, target, &names).await {
                        Ok(_) => {
                            info!(slot = %label, %reason, "orphaned slot torn down");
                            report.torn_down.push(label);
                        }
                        Err(e) => {
                            warn!(slot = %label, error = %e, "orphaned slot teardown failed");
                            report.errors.push((label, e.to_string()));
                        }
                    }
                }
            }
        }
    }
    report
}
