//! Shared test utilities for pgshift integration tests.
//!
//! Import via `mod common;` in integration test files:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use pgshift::bootstrap::{Orchestrator, OrchestratorBuilder};
use pgshift::cluster::{ClusterApi, ClusterApiError, ClusterMember, MemberRole};
use pgshift::config::{Config, ConnectionInfo, EndpointsConfig};
use pgshift::coordinator::CoordinatorConfig;
use pgshift::db::{MemoryConnector, MemoryDatabase, MemoryNetwork};
use pgshift::hooks::{FreezeHook, HookError};
use pgshift::job::{JobSpec, JobState, MigrationJob};
use pgshift::notify::{NotificationSink, NotifyError, TransitionEvent};
use pgshift::store::BackupStore;

pub const SOURCE: &str = "legacy";
pub const TARGET: &str = "cluster";

// ============================================================================
// Fakes
// ============================================================================

/// Freeze hook that counts calls and can be told to hang or refuse.
#[derive(Default)]
pub struct RecordingHook {
    pub freezes: AtomicUsize,
    pub unfreezes: AtomicUsize,
    pub refuse_freeze: AtomicBool,
    pub hang_unfreeze: AtomicBool,
    /// Runs just before a freeze is acknowledged.
    pub on_freeze: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RecordingHook {
    pub fn freezes(&self) -> usize {
        self.freezes.load(Ordering::SeqCst)
    }

    pub fn unfreezes(&self) -> usize {
        self.unfreezes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FreezeHook for RecordingHook {
    async fn freeze(&self, _job_id: &str) -> Result<(), HookError> {
        if self.refuse_freeze.load(Ordering::SeqCst) {
            return Err(HookError::Rejected {
                action: "freeze",
                status: 503,
                body: "maintenance".into(),
            });
        }
        if let Some(ref action) = *self.on_freeze.lock() {
            action();
        }
        self.freezes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unfreeze(&self, _job_id: &str) -> Result<(), HookError> {
        if self.hang_unfreeze.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.unfreezes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Notification sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<TransitionEvent>>,
}

impl RecordingSink {
    /// Target states in delivery order.
    pub fn states(&self) -> Vec<JobState> {
        self.events.lock().iter().map(|e| e.to).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, event: &TransitionEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Cluster API over a member list. Deleting the primary promotes the first
/// ready replica on the next listing.
pub struct FakeCluster {
    pub members: Mutex<Vec<ClusterMember>>,
}

impl FakeCluster {
    pub fn new(primary: &str, replica: &str) -> Self {
        let member = |name: &str, role| ClusterMember {
            name: name.into(),
            role,
            ready: true,
            connection: Some(TARGET.into()),
        };
        Self {
            members: Mutex::new(vec![
                member(primary, MemberRole::Primary),
                member(replica, MemberRole::Replica),
            ]),
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn members(&self) -> Result<Vec<ClusterMember>, ClusterApiError> {
        let mut members = self.members.lock();
        if !members.iter().any(|m| m.role == MemberRole::Primary) {
            if let Some(next) = members.iter_mut().find(|m| m.ready) {
                next.role = MemberRole::Primary;
            }
        }
        Ok(members.clone())
    }

    async fn delete_member(&self, name: &str) -> Result<(), ClusterApiError> {
        self.members.lock().retain(|m| m.name != name);
        Ok(())
    }
}

// ============================================================================
// Config helpers
// ============================================================================

/// Coordinator timings short enough for tests.
pub fn fast_coordinator() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval_ms: 20,
        convergence_window_ms: 300,
        max_sync_duration_secs: 10,
        validation_interval_ms: 200,
        freeze_timeout_ms: 1_000,
        final_sync_timeout_ms: 1_000,
        probe_timeout_ms: 500,
        lease_ttl_secs: 1,
        ..Default::default()
    }
}

/// Config with two in-memory databases and both roles on the source.
pub fn test_config(state_dir: &Path) -> Config {
    let mut config = Config {
        state_dir: state_dir.to_path_buf(),
        coordinator: fast_coordinator(),
        endpoints: EndpointsConfig {
            primary_write: SOURCE.into(),
            read_only: Some(SOURCE.into()),
        },
        ..Default::default()
    };
    for name in [SOURCE, TARGET] {
        config
            .connections
            .insert(name.into(), ConnectionInfo::new(MemoryNetwork::dsn(name)));
    }
    config.replication.backoff_base_ms = 5;
    config.replication.backoff_max_ms = 20;
    config.replication.lag_poll_timeout_ms = 500;
    config.validator.check_timeout_ms = 2_000;
    config
}

/// Job over `users`.
pub fn users_spec(id: &str) -> JobSpec {
    JobSpec {
        id: id.into(),
        source: SOURCE.into(),
        target: TARGET.into(),
        tables: vec!["users".into()],
        lag_tolerance_ms: 1_000,
        checksum: Default::default(),
    }
}

// ============================================================================
// Harness
// ============================================================================

/// One orchestrator over a shared memory network and state directory.
pub struct Harness {
    pub dir: TempDir,
    pub network: MemoryNetwork,
    pub store: Arc<BackupStore>,
    pub hook: Arc<RecordingHook>,
    pub sink: Arc<RecordingSink>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    /// Source seeded with three users; empty target.
    pub async fn new() -> Self {
        Self::with(|_| {}).await
    }

    /// Like [`Harness::new`] with a config tweak.
    pub async fn with(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let network = MemoryNetwork::with_apply_interval(Duration::from_millis(5));
        let source = network.node(SOURCE);
        source.create_table("users", &["id", "email"]);
        for (id, email) in [("1", "ada@example.com"), ("2", "bob@example.com"), ("3", "cy@example.com")] {
            source.insert("users", &[id, email]).unwrap();
        }
        network.node(TARGET);

        let store = Arc::new(BackupStore::in_memory());
        let hook = Arc::new(RecordingHook::default());
        let sink = Arc::new(RecordingSink::default());
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let orchestrator = build(config, &network, &store, &hook, &sink, None).await;
        Self {
            dir,
            network,
            store,
            hook,
            sink,
            orchestrator,
        }
    }

    pub fn source(&self) -> Arc<MemoryDatabase> {
        self.network.node(SOURCE)
    }

    pub fn target(&self) -> Arc<MemoryDatabase> {
        self.network.node(TARGET)
    }

    /// A second orchestrator on the same state, as after a process restart.
    pub async fn restart(&self) -> Orchestrator {
        let config = self.orchestrator.config.clone();
        build(config, &self.network, &self.store, &self.hook, &self.sink, None).await
    }

    /// Poll the job record until `done` holds.
    pub async fn wait_for(&self, id: &str, done: impl Fn(&MigrationJob) -> bool) -> MigrationJob {
        let jobs = self.orchestrator.coordinator.jobs();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(job) = jobs.load(id).await {
                if done(&job) {
                    return job;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job '{id}' never reached the expected condition"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub async fn build(
    config: Config,
    network: &MemoryNetwork,
    store: &Arc<BackupStore>,
    hook: &Arc<RecordingHook>,
    sink: &Arc<RecordingSink>,
    cluster: Option<Arc<dyn ClusterApi>>,
) -> Orchestrator {
    let mut builder = OrchestratorBuilder::new(config)
        .connector(Arc::new(MemoryConnector::new(network.clone())))
        .store(Arc::clone(store))
        .freeze_hook(Arc::clone(hook) as Arc<dyn FreezeHook>)
        .sink(Arc::clone(sink) as Arc<dyn NotificationSink>);
    if let Some(api) = cluster {
        builder = builder.cluster(api);
    }
    builder.build().await.unwrap()
}
